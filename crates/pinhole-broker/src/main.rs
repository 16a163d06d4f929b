//! Pinhole Broker - pairing broker CLI
//!
//! Publicly reachable side of a pinhole tunnel: accepts relay connections
//! from agents on one port, public traffic on another, and pairs them.

use anyhow::{Context, Result};
use clap::Parser;
use pinhole_broker::{Broker, BrokerConfig, BrokerError};
use pinhole_transport::TlsListenerConfig;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pinhole pairing broker - pairs public traffic with queued relay connections
#[derive(Parser, Debug)]
#[command(name = "pinhole-broker")]
#[command(about = "Pinhole pairing broker - pairs public traffic with queued relay connections")]
#[command(version)]
#[command(long_about = r#"
The broker listens on two ports: tunnel agents dial the relay port and are
queued after authorization; external clients dial the public port and each
connection is paired with the oldest queued relay connection sharing its
tunnel identity.

EXAMPLES:
  # Plaintext broker with a shared secret
  pinhole-broker --public-port 10081 --relay-port 10080 \
    --relay-plain --relay-secret "$SECRET"

  # TLS relay leg with client certificate identity
  pinhole-broker --public-port 10081 --relay-port 10080 \
    --relay-cert broker.crt --relay-key broker.key \
    --relay-ca-cert agents-ca.crt --relay-request-cert

ENVIRONMENT VARIABLES:
  PINHOLE_RELAY_SECRET  Shared relay secret
"#)]
struct Args {
    /// Public listener host
    #[arg(long, default_value = "0.0.0.0")]
    public_host: String,

    /// Public listener port
    #[arg(long)]
    public_port: u16,

    /// Relay listener host
    #[arg(long, default_value = "0.0.0.0")]
    relay_host: String,

    /// Relay listener port
    #[arg(long)]
    relay_port: u16,

    /// How long a public connection waits for a relay connection (ms)
    #[arg(long, default_value_t = 120_000)]
    public_timeout: u64,

    /// How long the broker waits for the relay authorization secret (ms)
    #[arg(long, default_value_t = 120_000)]
    relay_timeout: u64,

    /// Serve the public leg over TLS (plaintext by default)
    #[arg(long)]
    public_tls: bool,

    /// Public leg server certificate (PEM)
    #[arg(long)]
    public_cert: Option<String>,

    /// Public leg server private key (PEM)
    #[arg(long)]
    public_key: Option<String>,

    /// CA for verifying public-side client certificates (PEM)
    #[arg(long)]
    public_ca_cert: Option<String>,

    /// Require a verified client certificate on the public leg
    #[arg(long)]
    public_request_cert: bool,

    /// Only accept public-side client certificates with this common name
    #[arg(long)]
    public_cert_cn: Option<String>,

    /// Serve the relay leg over plaintext TCP (TLS by default)
    #[arg(long)]
    relay_plain: bool,

    /// Relay leg server certificate (PEM)
    #[arg(long)]
    relay_cert: Option<String>,

    /// Relay leg server private key (PEM)
    #[arg(long)]
    relay_key: Option<String>,

    /// CA for verifying relay-side client certificates (PEM)
    #[arg(long)]
    relay_ca_cert: Option<String>,

    /// Require a verified client certificate on the relay leg; the tunnel
    /// identity is derived from its common name
    #[arg(long)]
    relay_request_cert: bool,

    /// Only accept relay-side client certificates with this common name
    #[arg(long)]
    relay_cert_cn: Option<String>,

    /// Shared secret every relay connection must send as its first bytes
    #[arg(long, env = "PINHOLE_RELAY_SECRET")]
    relay_secret: Option<String>,

    /// Liveness HTTP port answering every request with "OK"
    #[arg(long)]
    health_check_port: Option<u16>,

    /// Suppress all logging except errors
    #[arg(long)]
    silent: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str, silent: bool) -> Result<()> {
    let level = if silent { "error" } else { log_level };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn tls_leg_config(
    leg: &str,
    enabled: bool,
    cert: &Option<String>,
    key: &Option<String>,
    ca_cert: &Option<String>,
    request_cert: bool,
) -> Result<Option<TlsListenerConfig>> {
    if !enabled {
        return Ok(None);
    }

    let (cert, key) = match (cert, key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => anyhow::bail!(
            "TLS is enabled on the {} leg but --{}-cert/--{}-key are not both set",
            leg,
            leg,
            leg
        ),
    };

    let mut config = TlsListenerConfig::new(cert, key);
    if request_cert {
        config = config.with_client_verification(ca_cert.as_deref());
    }
    Ok(Some(config))
}

fn build_broker_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = BrokerConfig::new(
        &args.public_host,
        args.public_port,
        &args.relay_host,
        args.relay_port,
    )
    .with_public_timeout(Duration::from_millis(args.public_timeout))
    .with_relay_timeout(Duration::from_millis(args.relay_timeout));

    config.public_tls = tls_leg_config(
        "public",
        args.public_tls,
        &args.public_cert,
        &args.public_key,
        &args.public_ca_cert,
        args.public_request_cert,
    )?;
    config.relay_tls = tls_leg_config(
        "relay",
        !args.relay_plain,
        &args.relay_cert,
        &args.relay_key,
        &args.relay_ca_cert,
        args.relay_request_cert,
    )?;

    if let Some(cn) = &args.public_cert_cn {
        config = config.with_public_cert_cn(cn.clone());
    }
    if let Some(cn) = &args.relay_cert_cn {
        config = config.with_relay_cert_cn(cn.clone());
    }

    if let Some(secret) = &args.relay_secret {
        config = config.with_relay_secret(secret.clone().into_bytes());
    }
    if let Some(port) = args.health_check_port {
        config = config.with_health_check_port(port);
    }

    Ok(config)
}

fn finish(result: Result<Result<(), BrokerError>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("Broker stopped normally");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!("Broker task panicked: {}", e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.silent)?;

    info!("Starting pinhole broker");

    let config = build_broker_config(&args).context("Failed to build broker configuration")?;

    let bound = Broker::new(config)
        .bind()
        .await
        .context("Failed to start broker")?;
    let handle = bound.handle();

    let mut broker_task = tokio::spawn(async move {
        if let Err(e) = bound.run().await {
            error!("Broker error: {}", e);
            return Err(e);
        }
        Ok(())
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, terminating...");
            handle.terminate();
            // Let the accept loop wind down before exiting
            finish(broker_task.await)?;
        }
        result = &mut broker_task => {
            finish(result)?;
        }
    }

    info!("Broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::parse_from([
            "pinhole-broker",
            "--public-port",
            "10081",
            "--relay-port",
            "10080",
            "--relay-plain",
        ]);
        let config = build_broker_config(&args).unwrap();

        assert_eq!(config.public_host, "0.0.0.0");
        assert_eq!(config.relay_host, "0.0.0.0");
        assert_eq!(config.public_timeout, Duration::from_millis(120_000));
        assert_eq!(config.relay_timeout, Duration::from_millis(120_000));
        assert!(config.public_tls.is_none());
        assert!(config.relay_tls.is_none());
        assert!(config.relay_secret.is_none());
    }

    #[test]
    fn test_relay_tls_requires_cert_and_key() {
        let args = Args::parse_from([
            "pinhole-broker",
            "--public-port",
            "10081",
            "--relay-port",
            "10080",
        ]);
        // Relay leg defaults to TLS, so missing cert/key is a startup error
        assert!(build_broker_config(&args).is_err());
    }

    #[test]
    fn test_request_cert_flag_builds_verifying_config() {
        let args = Args::parse_from([
            "pinhole-broker",
            "--public-port",
            "10081",
            "--relay-port",
            "10080",
            "--relay-cert",
            "broker.crt",
            "--relay-key",
            "broker.key",
            "--relay-ca-cert",
            "agents-ca.crt",
            "--relay-request-cert",
        ]);
        let config = build_broker_config(&args).unwrap();
        let relay_tls = config.relay_tls.unwrap();
        assert!(relay_tls.request_cert);
        assert_eq!(relay_tls.ca_cert_path.as_deref(), Some("agents-ca.crt"));
    }

    #[test]
    fn test_cert_cn_pins_are_wired_per_leg() {
        let args = Args::parse_from([
            "pinhole-broker",
            "--public-port",
            "10081",
            "--relay-port",
            "10080",
            "--relay-plain",
            "--public-cert-cn",
            "clients.example.com",
            "--relay-cert-cn",
            "tenant-a",
        ]);
        let config = build_broker_config(&args).unwrap();
        assert_eq!(config.public_cert_cn.as_deref(), Some("clients.example.com"));
        assert_eq!(config.relay_cert_cn.as_deref(), Some("tenant-a"));
    }
}
