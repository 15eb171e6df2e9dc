//! Server TLS context and device-certificate authentication.
//!
//! The acceptor presents the server certificate chain from config and
//! demands a client certificate on every connection.  Trust is exactly the
//! union of device certificates ConfigQuery knows: a presented leaf must
//! byte-match one of them and carry a non-empty subject commonName, which
//! becomes the device identity.

use cl_config::{ConfigError, ConfigQuery};
use rustls::pki_types::CertificateDer;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::DistinguishedName;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("certificate bundle: {0}")]
    Pem(String),
    #[error("no certificate in server bundle")]
    NoCertificate,
    #[error("no private key in server bundle")]
    NoPrivateKey,
    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client certificate unparsable: {0}")]
    CertificateParse(String),
    #[error("client certificate has an empty commonName")]
    EmptyCommonName,
}

/// Build an acceptor from the current config: server key + chain, and the
/// pinned device trust set.  Rebuilt by the periodic certificate refresh.
pub fn build_acceptor(config: &dyn ConfigQuery) -> Result<TlsAcceptor, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let bundle = config.certificate_pem()?;
    let mut pem = bundle.as_bytes();
    let chain = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let mut pem = bundle.as_bytes();
    let key = rustls_pemfile::private_key(&mut pem)
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or(TlsError::NoPrivateKey)?;

    let verifier = PinnedDeviceVerifier::from_config(config, Arc::clone(&provider))?;

    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Extract the device id (subject commonName) from an accepted client
/// certificate.
pub fn device_id_from_certificate(cert: &CertificateDer<'_>) -> Result<String, TlsError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("");
    if common_name.is_empty() {
        return Err(TlsError::EmptyCommonName);
    }
    Ok(common_name.to_owned())
}

// ---------------------------------------------------------------------------
// Pinned client verifier
// ---------------------------------------------------------------------------

/// Accepts exactly the device certificates from config, and only those with
/// a usable identity.
#[derive(Debug)]
struct PinnedDeviceVerifier {
    allowed: Vec<CertificateDer<'static>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl PinnedDeviceVerifier {
    fn from_config(
        config: &dyn ConfigQuery,
        provider: Arc<rustls::crypto::CryptoProvider>,
    ) -> Result<Self, TlsError> {
        let mut allowed = Vec::new();
        for pem in config.device_certificates() {
            let mut bytes = pem.as_bytes();
            for cert in rustls_pemfile::certs(&mut bytes) {
                allowed.push(cert.map_err(|e| TlsError::Pem(e.to_string()))?);
            }
        }
        Ok(Self { allowed, provider })
    }
}

impl ClientCertVerifier for PinnedDeviceVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let pinned = self
            .allowed
            .iter()
            .any(|allowed| allowed.as_ref() == end_entity.as_ref());
        if !pinned {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ));
        }

        // A trusted certificate without an identity is still unusable.
        match device_id_from_certificate(end_entity) {
            Ok(_) => Ok(ClientCertVerified::assertion()),
            Err(_) => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
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
        cert: &CertificateDer<'_>,
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
