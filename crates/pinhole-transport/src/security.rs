//! Transport security configuration for outbound dials

use crate::error::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Security configuration for a single leg (relay or target side)
#[derive(Debug, Clone, Default)]
pub struct TransportSecurityConfig {
    /// Use TLS instead of plaintext TCP
    pub tls: bool,

    /// Verify the peer certificate (TLS only)
    pub verify_cert: bool,

    /// CA certificate path overriding the system roots (PEM)
    pub ca_cert_path: Option<String>,

    /// Client certificate path, offered when the peer requests one (PEM)
    pub client_cert_path: Option<String>,

    /// Client private key path (PEM)
    pub client_key_path: Option<String>,

    /// Server name for SNI/verification; defaults to the dialed host
    pub server_name: Option<String>,
}

impl TransportSecurityConfig {
    /// Plaintext TCP
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// TLS with certificate verification against the system roots
    pub fn tls() -> Self {
        Self {
            tls: true,
            verify_cert: true,
            ..Self::default()
        }
    }

    /// TLS without certificate verification (INSECURE)
    pub fn tls_insecure() -> Self {
        Self {
            tls: true,
            verify_cert: false,
            ..Self::default()
        }
    }

    /// Offer a client certificate during the TLS handshake
    pub fn with_client_identity(mut self, cert_path: &str, key_path: &str) -> Self {
        self.client_cert_path = Some(cert_path.to_string());
        self.client_key_path = Some(key_path.to_string());
        self
    }

    /// Override the server name used for SNI and verification
    pub fn with_server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    /// Build a rustls TlsConnector for this configuration
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        if let Some(ca_path) = &self.ca_cert_path {
            for cert in load_certs(Path::new(ca_path))? {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid CA cert: {}", e))
                })?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let builder = if self.verify_cert {
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        };

        let client_crypto = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(Path::new(cert_path))?;
                let key = load_private_key(Path::new(key_path))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid client cert: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::ConfigurationError(
                    "Client cert and key must both be set".to_string(),
                ))
            }
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub(crate) fn load_certs(
    path: &Path,
) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

pub(crate) fn load_private_key(
    path: &Path,
) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
