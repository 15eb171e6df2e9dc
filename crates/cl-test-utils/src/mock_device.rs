//! Mock device peer for server-session tests: a raw framed-protocol client
//! presenting a chosen TLS identity and trusting any server certificate.

use cl_protocol::{
    read_message, write_message, ControlMessage, FrameReader, FrameWriter, ProtocolError,
};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub struct MockDevice {
    reader: FrameReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: FrameWriter<WriteHalf<TlsStream<TcpStream>>>,
}

impl MockDevice {
    /// Connect to the control server with the given identity bundle
    /// (certificate + key PEM).
    pub async fn connect(addr: SocketAddr, identity_pem: &str) -> std::io::Result<Self> {
        let connector = build_connector(identity_pem);
        let tcp = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from("localhost").expect("server name");
        let tls = connector.connect(server_name, tcp).await?;

        let (read_half, write_half) = tokio::io::split(tls);
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        })
    }

    pub async fn send(&mut self, message: &ControlMessage) -> Result<(), ProtocolError> {
        write_message(&mut self.writer, message).await
    }

    pub async fn recv(&mut self) -> Result<ControlMessage, ProtocolError> {
        read_message(&mut self.reader).await
    }

    /// Receive with a deadline; `None` when nothing arrives in time.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ControlMessage> {
        tokio::time::timeout(timeout, self.recv()).await.ok()?.ok()
    }

    /// Run the full device-side handshake and return the delivered config.
    pub async fn handshake(&mut self) -> Result<cl_protocol::ClientConfig, ProtocolError> {
        self.send(&ControlMessage::ClientGreeting).await?;
        let greeting = self.recv().await?;
        assert!(
            matches!(greeting, ControlMessage::ServerGreeting),
            "expected ServerGreeting, got {greeting:?}"
        );

        self.send(&ControlMessage::ClientConfigRequest).await?;
        let reply = self.recv().await?;
        let config = match reply {
            ControlMessage::ClientConfigReply(config) => config,
            other => panic!("expected ClientConfigReply, got {other:?}"),
        };

        self.send(&ControlMessage::ClientReady).await?;
        Ok(config)
    }
}

fn build_connector(identity_pem: &str) -> TlsConnector {
    let mut pem = identity_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .expect("identity certs");
    let mut pem = identity_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut pem)
        .expect("identity key")
        .expect("identity key present");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_client_auth_cert(certs, key)
        .expect("client tls config");
    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
