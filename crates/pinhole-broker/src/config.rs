//! Broker configuration and tunnel identity

use bytes::Bytes;
use pinhole_transport::{TlsListenerConfig, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Key a public connection must share with a relay connection to be paired
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey(String);

impl TunnelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The single implicit identity used when no client-certificate
    /// identity is configured (secret-mode brokers)
    pub fn shared() -> Self {
        Self("shared".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps a verified client-certificate common name to a tunnel key
pub type CnToTunnelKey = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Pairing broker configuration
#[derive(Clone)]
pub struct BrokerConfig {
    /// Public-facing listener
    pub public_host: String,
    pub public_port: u16,

    /// Relay-facing listener (tunnel agents dial this)
    pub relay_host: String,
    pub relay_port: u16,

    /// How long a public connection waits for a queued relay connection
    pub public_timeout: Duration,

    /// How long the broker waits for the relay authorization secret
    pub relay_timeout: Duration,

    /// TLS material for the public leg; plaintext when unset
    pub public_tls: Option<TlsListenerConfig>,

    /// TLS material for the relay leg; plaintext when unset
    pub relay_tls: Option<TlsListenerConfig>,

    /// Shared secret every relay connection must send as its first bytes
    pub relay_secret: Option<Bytes>,

    /// Pinned client-certificate common name for the public leg; a verified
    /// certificate with any other CN is rejected
    pub public_cert_cn: Option<String>,

    /// Pinned client-certificate common name for the relay leg
    pub relay_cert_cn: Option<String>,

    /// Liveness HTTP endpoint port; disabled when unset
    pub health_check_port: Option<u16>,

    /// Mapping from certificate common name to tunnel key (identity mapping
    /// by default)
    pub cn_to_tunnel_key: CnToTunnelKey,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("public_host", &self.public_host)
            .field("public_port", &self.public_port)
            .field("relay_host", &self.relay_host)
            .field("relay_port", &self.relay_port)
            .field("public_timeout", &self.public_timeout)
            .field("relay_timeout", &self.relay_timeout)
            .field("public_tls", &self.public_tls)
            .field("relay_tls", &self.relay_tls)
            .field("has_relay_secret", &self.relay_secret.is_some())
            .field("public_cert_cn", &self.public_cert_cn)
            .field("relay_cert_cn", &self.relay_cert_cn)
            .field("health_check_port", &self.health_check_port)
            .finish()
    }
}

impl BrokerConfig {
    pub fn new(public_host: &str, public_port: u16, relay_host: &str, relay_port: u16) -> Self {
        Self {
            public_host: public_host.to_string(),
            public_port,
            relay_host: relay_host.to_string(),
            relay_port,
            public_timeout: Duration::from_millis(120_000),
            relay_timeout: Duration::from_millis(120_000),
            public_tls: None,
            relay_tls: None,
            relay_secret: None,
            public_cert_cn: None,
            relay_cert_cn: None,
            health_check_port: None,
            cn_to_tunnel_key: Arc::new(|cn| cn.to_string()),
        }
    }

    pub fn with_relay_secret(mut self, secret: impl Into<Bytes>) -> Self {
        self.relay_secret = Some(secret.into());
        self
    }

    pub fn with_public_timeout(mut self, timeout: Duration) -> Self {
        self.public_timeout = timeout;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_public_cert_cn(mut self, cn: impl Into<String>) -> Self {
        self.public_cert_cn = Some(cn.into());
        self
    }

    pub fn with_relay_cert_cn(mut self, cn: impl Into<String>) -> Self {
        self.relay_cert_cn = Some(cn.into());
        self
    }

    pub fn with_health_check_port(mut self, port: u16) -> Self {
        self.health_check_port = Some(port);
        self
    }

    pub fn with_cn_to_tunnel_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.cn_to_tunnel_key = Arc::new(f);
        self
    }
}
