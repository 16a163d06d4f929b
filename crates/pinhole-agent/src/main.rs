//! Pinhole Agent - reverse tunnel agent CLI
//!
//! Dials outbound relay connections to a pinhole broker so that a private
//! target service can accept inbound public traffic without being reachable
//! itself.

use anyhow::{Context, Result};
use clap::Parser;
use pinhole_agent::{Agent, AgentConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pinhole reverse tunnel agent - exposes a private target through a public broker
#[derive(Parser, Debug)]
#[command(name = "pinhole-agent")]
#[command(about = "Pinhole reverse tunnel agent - exposes a private target through a public broker")]
#[command(version)]
#[command(long_about = r#"
The agent keeps a pool of outbound relay connections open to a pinhole
broker. When public traffic arrives at the broker, it is paired with one of
these connections and forwarded to the target service.

EXAMPLES:
  # Expose a local web server through a broker, one relay connection
  pinhole-agent --target-host 127.0.0.1 --target-port 8080 \
    --relay-host broker.example.com --relay-port 10080 \
    --relay-secret "$SECRET"

  # Five concurrent pending connections, plaintext relay leg
  pinhole-agent --target-host 127.0.0.1 --target-port 8080 \
    --relay-host broker.internal --relay-port 10080 \
    --relay-plain --relay-num-conn 5

ENVIRONMENT VARIABLES:
  PINHOLE_TARGET_HOST   Target service host
  PINHOLE_TARGET_PORT   Target service port
  PINHOLE_RELAY_HOST    Broker relay host
  PINHOLE_RELAY_PORT    Broker relay port
  PINHOLE_RELAY_SECRET  Shared relay secret
"#)]
struct Args {
    /// Target service host
    #[arg(long, env = "PINHOLE_TARGET_HOST")]
    target_host: String,

    /// Target service port
    #[arg(long, env = "PINHOLE_TARGET_PORT")]
    target_port: u16,

    /// Broker relay host
    #[arg(long, env = "PINHOLE_RELAY_HOST")]
    relay_host: String,

    /// Broker relay port
    #[arg(long, env = "PINHOLE_RELAY_PORT")]
    relay_port: u16,

    /// Use TLS toward the target service (plaintext by default)
    #[arg(long)]
    target_tls: bool,

    /// Skip target certificate verification (insecure)
    #[arg(long)]
    target_insecure: bool,

    /// Use plaintext TCP toward the broker (TLS by default)
    #[arg(long)]
    relay_plain: bool,

    /// Verify the broker certificate (off by default, matching self-signed
    /// broker deployments)
    #[arg(long)]
    relay_verify_cert: bool,

    /// Client certificate offered on the relay leg (PEM), for brokers in
    /// certificate-identity mode
    #[arg(long)]
    relay_cert: Option<String>,

    /// Client private key for --relay-cert (PEM)
    #[arg(long)]
    relay_key: Option<String>,

    /// Shared secret sent as the first bytes on each relay connection
    #[arg(long, env = "PINHOLE_RELAY_SECRET")]
    relay_secret: Option<String>,

    /// Number of concurrently pending relay connections
    #[arg(long, default_value_t = 1)]
    relay_num_conn: usize,

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

fn build_agent_config(args: &Args) -> AgentConfig {
    let mut config = AgentConfig::new(
        &args.target_host,
        args.target_port,
        &args.relay_host,
        args.relay_port,
    )
    .with_relay_num_conn(args.relay_num_conn);

    config.target_tls = args.target_tls;
    config.target_verify_cert = !args.target_insecure;
    config.relay_tls = !args.relay_plain;
    config.relay_verify_cert = args.relay_verify_cert;
    config.relay_client_cert = args.relay_cert.clone();
    config.relay_client_key = args.relay_key.clone();

    if let Some(secret) = &args.relay_secret {
        config = config.with_relay_secret(secret.clone().into_bytes());
    }

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.silent)?;

    info!("Pinhole agent starting...");
    info!("Target: {}:{}", args.target_host, args.target_port);
    info!(
        "Relay: {}:{} over {}",
        args.relay_host,
        args.relay_port,
        if args.relay_plain { "TCP" } else { "TLS" }
    );
    info!(
        "Relay connection {} use a secret",
        if args.relay_secret.is_some() {
            "WILL"
        } else {
            "WILL NOT"
        }
    );

    let config = build_agent_config(&args);
    let mut agent = Agent::new(config).context("Failed to create agent")?;
    let handle = agent.handle();

    agent.start();

    let mut agent_task = tokio::spawn(async move {
        agent.run().await;
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, terminating...");
            handle.terminate();
            // Let the event loop terminate its pipes before exiting
            if let Err(e) = agent_task.await {
                error!("Agent task panicked: {}", e);
                return Err(e.into());
            }
        }
        result = &mut agent_task => {
            if let Err(e) = result {
                error!("Agent task panicked: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}
