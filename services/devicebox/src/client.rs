//! Control-channel client.
//!
//! Maintains the mutually-authenticated TLS connection to the central
//! server.  On any transport, TLS, or protocol failure the controller is
//! reset and a fixed-interval reconnect timer re-enters the connect state;
//! backoff is deliberately flat because the fleet is small and
//! operator-controlled.
//!
//! Connection lifecycle:
//! connect → TLS handshake → ClientGreeting → ServerGreeting →
//! ClientConfigRequest → ClientConfigReply (config load) → ClientReady →
//! serve RequestStream / StopStream, reporting StreamStatus.

use crate::config::AuthConfig;
use crate::controller::{ControllerClosed, ControllerEvent, ControllerHandle};
use cl_protocol::{
    read_message, write_message, ControlMessage, FrameReader, FrameWriter, ProtocolError,
    StreamStatus,
};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client identity: {0}")]
    Identity(String),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server host \"{0}\"")]
    InvalidHost(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected message type {0} from server")]
    UnexpectedMessage(u16),
    #[error(transparent)]
    Controller(#[from] ControllerClosed),
}

#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub auth: AuthConfig,
    pub reconnect_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Greeting,
    Ready,
}

pub struct DeviceClient {
    config: DeviceClientConfig,
    controller: ControllerHandle,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

impl DeviceClient {
    pub fn new(
        config: DeviceClientConfig,
        controller: ControllerHandle,
        events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    ) -> Self {
        Self {
            config,
            controller,
            events_rx,
        }
    }

    /// Validate the TLS identity without connecting.  Called at startup so
    /// a broken certificate is a fatal config error, not a reconnect loop.
    pub fn check_identity(config: &DeviceClientConfig) -> Result<(), ClientError> {
        build_connector(&config.auth)?;
        ServerName::try_from(config.server_host.clone())
            .map_err(|_| ClientError::InvalidHost(config.server_host.clone()))?;
        Ok(())
    }

    /// Drive the reconnect loop until `shutdown` flips.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let connector = match build_connector(&self.config.auth) {
            Ok(connector) => connector,
            Err(e) => {
                warn!(error = %e, "connect cancelled, client identity unusable");
                return;
            }
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            info!(
                host = %self.config.server_host,
                port = self.config.server_port,
                "connecting"
            );
            match self.run_connection(&connector, &mut shutdown_rx).await {
                Ok(()) => break,
                Err(e) => warn!(error = %e, "connection lost"),
            }

            if self.controller.reset().await.is_err() {
                warn!("controller gone, client stopping");
                break;
            }

            debug!(
                seconds = self.config.reconnect_interval.as_secs(),
                "reconnect scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("client stopped");
    }

    async fn run_connection(
        &mut self,
        connector: &TlsConnector,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let tcp = TcpStream::connect((self.config.server_host.as_str(), self.config.server_port))
            .await?;
        let server_name = ServerName::try_from(self.config.server_host.clone())
            .map_err(|_| ClientError::InvalidHost(self.config.server_host.clone()))?;
        let tls = connector.connect(server_name, tcp).await?;
        info!("connected");

        let (read_half, write_half) = tokio::io::split(tls);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        let mut state = ClientState::Greeting;

        write_message(&mut writer, &ControlMessage::ClientGreeting).await?;

        loop {
            tokio::select! {
                message = read_message(&mut reader) => {
                    state = self.handle_message(message?, state, &mut writer).await?;
                }
                Some(event) = self.events_rx.recv() => {
                    let ControllerEvent::StreamStatus { source_id, success } = event;
                    debug!(source_id = %source_id, success, "reporting stream status");
                    write_message(
                        &mut writer,
                        &ControlMessage::StreamStatus(StreamStatus { source_id, success }),
                    )
                    .await?;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_message<W>(
        &mut self,
        message: ControlMessage,
        state: ClientState,
        writer: &mut FrameWriter<W>,
    ) -> Result<ClientState, ClientError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        match message {
            ControlMessage::ServerGreeting => {
                debug!("got ServerGreeting");
                write_message(writer, &ControlMessage::ClientConfigRequest).await?;
                Ok(state)
            }
            ControlMessage::ClientConfigReply(config) => {
                debug!(sources = config.sources.len(), "got ClientConfigReply");
                self.controller.load_config(config).await?;
                write_message(writer, &ControlMessage::ClientReady).await?;
                info!("ready");
                Ok(ClientState::Ready)
            }
            ControlMessage::ClientConfigUpdated(config) => {
                debug!(sources = config.sources.len(), "got ClientConfigUpdated");
                self.controller.update_config(config).await?;
                write_message(writer, &ControlMessage::ClientReady).await?;
                Ok(ClientState::Ready)
            }
            ControlMessage::RequestStream(request) => {
                debug!(source_id = %request.source_id, "got RequestStream");
                if state != ClientState::Ready {
                    warn!(source_id = %request.source_id, "stream request before ready");
                }
                self.controller.stream_requested(request).await?;
                Ok(state)
            }
            ControlMessage::StopStream(request) => {
                debug!(source_id = %request.source_id, "got StopStream");
                self.controller.stop_stream(request).await?;
                Ok(state)
            }
            other => Err(ClientError::UnexpectedMessage(other.message_type())),
        }
    }
}

// ---------------------------------------------------------------------------
// TLS client context
// ---------------------------------------------------------------------------

fn build_connector(auth: &AuthConfig) -> Result<TlsConnector, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut pem = auth.certificate_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Identity(format!("certificate parse: {e}")))?;
    if certs.is_empty() {
        return Err(ClientError::Identity(
            "no certificate in identity bundle".to_owned(),
        ));
    }

    let mut pem = auth.certificate_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut pem)
        .map_err(|e| ClientError::Identity(format!("private key parse: {e}")))?
        .ok_or_else(|| ClientError::Identity("no private key in identity bundle".to_owned()))?;

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = match &auth.server_ca_pem {
        Some(ca_pem) => {
            let mut roots = rustls::RootCertStore::empty();
            let mut ca_bytes = ca_pem.as_bytes();
            for cert in rustls_pemfile::certs(&mut ca_bytes) {
                let cert =
                    cert.map_err(|e| ClientError::Identity(format!("server CA parse: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Identity(format!("server CA unusable: {e}")))?;
            }
            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)?
        }
        // Debug builds run against throwaway certificates that chain to
        // nothing; skip server verification there, as release never does.
        None if cfg!(debug_assertions) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_client_auth_cert(certs, key)?,
        None => {
            return Err(ClientError::Identity(
                "server CA bundle required in release builds".to_owned(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
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
