//! Server-side TLS acceptor configuration

use crate::error::{TransportError, TransportResult};
use crate::security::{ensure_crypto_provider, load_certs, load_private_key};
use std::path::Path;
use std::sync::Arc;

/// TLS material for a listening leg (broker side)
#[derive(Debug, Clone)]
pub struct TlsListenerConfig {
    /// Server certificate path (PEM)
    pub cert_path: String,

    /// Server private key path (PEM)
    pub key_path: String,

    /// CA used to verify client certificates (PEM); system roots if unset
    pub ca_cert_path: Option<String>,

    /// Require and verify a client certificate
    pub request_cert: bool,
}

impl TlsListenerConfig {
    pub fn new(cert_path: &str, key_path: &str) -> Self {
        Self {
            cert_path: cert_path.to_string(),
            key_path: key_path.to_string(),
            ca_cert_path: None,
            request_cert: false,
        }
    }

    /// Require a verified client certificate on every accepted connection
    pub fn with_client_verification(mut self, ca_cert_path: Option<&str>) -> Self {
        self.request_cert = true;
        self.ca_cert_path = ca_cert_path.map(str::to_string);
        self
    }

    /// Build a rustls TlsAcceptor for this configuration
    pub fn build_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        ensure_crypto_provider();

        let certs = load_certs(Path::new(&self.cert_path))?;
        let key = load_private_key(Path::new(&self.key_path))?;

        let builder = if self.request_cert {
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

            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    TransportError::ConfigurationError(format!(
                        "Client verifier build failed: {}",
                        e
                    ))
                })?;

            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            rustls::ServerConfig::builder().with_no_client_auth()
        };

        let server_crypto = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}
