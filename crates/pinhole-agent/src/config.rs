//! Agent configuration

use bytes::Bytes;
use pinhole_pipe::PipeConfig;
use pinhole_transport::TransportSecurityConfig;
use std::time::Duration;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Tunnel agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Private service the tunnel exposes
    pub target_host: String,
    pub target_port: u16,

    /// Public broker relay endpoint
    pub relay_host: String,
    pub relay_port: u16,

    /// Use TLS toward the target service
    pub target_tls: bool,
    /// Verify the target certificate
    pub target_verify_cert: bool,

    /// Use TLS toward the broker
    pub relay_tls: bool,
    /// Verify the broker certificate
    pub relay_verify_cert: bool,

    /// Client certificate offered on the relay leg (PEM), for brokers in
    /// certificate-identity mode
    pub relay_client_cert: Option<String>,
    pub relay_client_key: Option<String>,

    /// Shared secret written verbatim as the first bytes on each relay leg
    pub relay_secret: Option<Bytes>,

    /// Number of concurrently pending relay connections
    pub relay_num_conn: usize,

    /// Delay before replacing a relay connection the broker dropped
    pub replenish_delay: Duration,
}

impl AgentConfig {
    pub fn new(target_host: &str, target_port: u16, relay_host: &str, relay_port: u16) -> Self {
        Self {
            target_host: target_host.to_string(),
            target_port,
            relay_host: relay_host.to_string(),
            relay_port,
            target_tls: false,
            target_verify_cert: true,
            relay_tls: true,
            relay_verify_cert: false,
            relay_secret: None,
            relay_client_cert: None,
            relay_client_key: None,
            relay_num_conn: 1,
            replenish_delay: Duration::from_secs(5),
        }
    }

    pub fn with_relay_secret(mut self, secret: impl Into<Bytes>) -> Self {
        self.relay_secret = Some(secret.into());
        self
    }

    pub fn with_relay_num_conn(mut self, count: usize) -> Self {
        self.relay_num_conn = count;
        self
    }

    pub fn with_replenish_delay(mut self, delay: Duration) -> Self {
        self.replenish_delay = delay;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        if self.target_host.is_empty() || self.relay_host.is_empty() {
            return Err(AgentError::Configuration(
                "Target and relay hosts must be set".to_string(),
            ));
        }
        if self.relay_num_conn == 0 {
            return Err(AgentError::Configuration(
                "relay_num_conn must be at least 1".to_string(),
            ));
        }
        if self.relay_client_cert.is_some() != self.relay_client_key.is_some() {
            return Err(AgentError::Configuration(
                "Relay client cert and key must both be set".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn pipe_config(&self) -> PipeConfig {
        let mut relay_security = TransportSecurityConfig {
            tls: self.relay_tls,
            verify_cert: self.relay_verify_cert,
            ..TransportSecurityConfig::default()
        };
        relay_security.client_cert_path = self.relay_client_cert.clone();
        relay_security.client_key_path = self.relay_client_key.clone();

        let target_security = TransportSecurityConfig {
            tls: self.target_tls,
            verify_cert: self.target_verify_cert,
            ..TransportSecurityConfig::default()
        };

        PipeConfig {
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            relay_host: self.relay_host.clone(),
            relay_port: self.relay_port,
            relay_security,
            target_security,
            relay_secret: self.relay_secret.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_client_conventions() {
        let config = AgentConfig::new("localhost", 8080, "relay.example.com", 10080);
        assert!(!config.target_tls);
        assert!(config.target_verify_cert);
        assert!(config.relay_tls);
        assert!(!config.relay_verify_cert);
        assert_eq!(config.relay_num_conn, 1);
        assert_eq!(config.replenish_delay, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config =
            AgentConfig::new("localhost", 8080, "relay.example.com", 10080).with_relay_num_conn(0);
        assert!(matches!(
            config.validate(),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn test_client_identity_requires_both_paths() {
        let mut config = AgentConfig::new("localhost", 8080, "relay.example.com", 10080);
        config.relay_client_cert = Some("client.crt".to_string());
        assert!(matches!(
            config.validate(),
            Err(AgentError::Configuration(_))
        ));
    }
}
