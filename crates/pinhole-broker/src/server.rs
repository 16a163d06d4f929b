//! Broker listeners, relay authorization, and pairing

use crate::config::{BrokerConfig, BrokerError, TunnelKey};
use crate::health;
use crate::queues::TunnelQueues;
use pinhole_pipe::{forward_pair, next_pipe_id};
use pinhole_transport::{set_keep_alive, RelayStream, TlsListenerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle for terminating a running broker from another task
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    cancel: CancellationToken,
}

impl BrokerHandle {
    /// Stop accepting, close active pairings, and shut down. Idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

struct Shared {
    config: BrokerConfig,
    queues: TunnelQueues,
}

/// Pairing broker
pub struct Broker {
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Bind both listeners and run until terminated
    pub async fn start(self) -> Result<(), BrokerError> {
        self.bind().await?.run().await
    }

    /// Bind listeners and build TLS acceptors; configuration problems
    /// surface here, before any connection is accepted
    pub async fn bind(self) -> Result<BoundBroker, BrokerError> {
        let config = self.config;

        let relay_acceptor = config
            .relay_tls
            .as_ref()
            .map(TlsListenerConfig::build_acceptor)
            .transpose()?;
        let public_acceptor = config
            .public_tls
            .as_ref()
            .map(TlsListenerConfig::build_acceptor)
            .transpose()?;

        let relay_listener = bind(&config.relay_host, config.relay_port).await?;
        let public_listener = bind(&config.public_host, config.public_port).await?;
        let relay_addr = relay_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;

        let cancel = CancellationToken::new();

        info!(
            "Public endpoint is {}, connection will be {}",
            public_addr,
            leg_description(config.public_tls.as_ref())
        );
        info!(
            "Relay endpoint is {}, connection will be {}",
            relay_addr,
            leg_description(config.relay_tls.as_ref())
        );
        info!(
            "Relay connection {} use a secret",
            if config.relay_secret.is_some() {
                "WILL"
            } else {
                "WILL NOT"
            }
        );

        if let Some(port) = config.health_check_port {
            let health_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = health::serve(port, health_cancel).await {
                    error!("[health] liveness endpoint failed: {}", e);
                }
            });
        }

        Ok(BoundBroker {
            shared: Arc::new(Shared {
                config,
                queues: TunnelQueues::new(),
            }),
            relay_listener,
            public_listener,
            relay_acceptor,
            public_acceptor,
            relay_addr,
            public_addr,
            cancel,
        })
    }
}

/// A broker with bound listeners, ready to accept
pub struct BoundBroker {
    shared: Arc<Shared>,
    relay_listener: TcpListener,
    public_listener: TcpListener,
    relay_acceptor: Option<TlsAcceptor>,
    public_acceptor: Option<TlsAcceptor>,
    relay_addr: SocketAddr,
    public_addr: SocketAddr,
    cancel: CancellationToken,
}

impl BoundBroker {
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Accept relay and public connections until terminated
    pub async fn run(self) -> Result<(), BrokerError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Broker terminating");
                    return Ok(());
                }
                result = self.relay_listener.accept() => {
                    match result {
                        Ok((tcp, peer)) => {
                            debug!("Relay connection from {}", peer);
                            let shared = self.shared.clone();
                            let acceptor = self.relay_acceptor.clone();
                            tokio::spawn(handle_relay_conn(tcp, peer, acceptor, shared));
                        }
                        Err(e) => error!("Failed to accept relay connection: {}", e),
                    }
                }
                result = self.public_listener.accept() => {
                    match result {
                        Ok((tcp, peer)) => {
                            debug!("Public connection from {}", peer);
                            let shared = self.shared.clone();
                            let acceptor = self.public_acceptor.clone();
                            let cancel = self.cancel.child_token();
                            tokio::spawn(handle_public_conn(tcp, peer, acceptor, shared, cancel));
                        }
                        Err(e) => error!("Failed to accept public connection: {}", e),
                    }
                }
            }
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, BrokerError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| BrokerError::BindError {
            address: host.to_string(),
            port,
            reason: e.to_string(),
        })
}

fn leg_description(tls: Option<&TlsListenerConfig>) -> &'static str {
    match tls {
        None => "TCP",
        Some(config) if config.request_cert => "TLS with client certificate verification",
        Some(_) => "TLS",
    }
}

async fn upgrade(
    tcp: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> std::io::Result<RelayStream> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(tcp).await?;
            Ok(RelayStream::Tls(Box::new(tokio_rustls::TlsStream::Server(
                tls,
            ))))
        }
        None => Ok(RelayStream::Tcp(tcp)),
    }
}

/// Check a pinned common name against the peer certificate. No pin means
/// any (or no) certificate passes.
fn pinned_cn_matches(stream: &RelayStream, pinned: Option<&str>) -> bool {
    match pinned {
        None => true,
        Some(pinned) => stream.peer_certificate_cn().as_deref() == Some(pinned),
    }
}

/// Tunnel identity for an accepted leg: the mapped certificate common name
/// in certificate mode, the shared implicit identity otherwise
fn resolve_identity(
    stream: &RelayStream,
    tls: Option<&TlsListenerConfig>,
    config: &BrokerConfig,
) -> Option<TunnelKey> {
    if tls.map(|c| c.request_cert).unwrap_or(false) {
        let cn = stream.peer_certificate_cn()?;
        Some(TunnelKey::new((config.cn_to_tunnel_key)(&cn)))
    } else {
        Some(TunnelKey::shared())
    }
}

async fn handle_relay_conn(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) {
    if let Err(e) = set_keep_alive(&tcp) {
        warn!("Failed to enable keep-alive for {}: {}", peer, e);
    }

    let mut stream = match upgrade(tcp, acceptor).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TLS handshake failed on relay leg from {}: {}", peer, e);
            return;
        }
    };

    if !pinned_cn_matches(&stream, shared.config.relay_cert_cn.as_deref()) {
        warn!(
            "Relay connection from {} does not match the pinned certificate common name, closing",
            peer
        );
        return;
    }

    let Some(key) = resolve_identity(&stream, shared.config.relay_tls.as_ref(), &shared.config)
    else {
        warn!(
            "Relay connection from {} has no client certificate identity, closing",
            peer
        );
        return;
    };

    // Authorization: the secret must arrive verbatim as the first bytes
    if let Some(secret) = &shared.config.relay_secret {
        let mut received = vec![0u8; secret.len()];
        match timeout(shared.config.relay_timeout, stream.read_exact(&mut received)).await {
            Ok(Ok(_)) if received.as_slice() == secret.as_ref() => {
                debug!("Relay connection from {} authorized", peer);
            }
            Ok(Ok(_)) => {
                warn!("Relay connection from {} sent a bad secret, closing", peer);
                return;
            }
            Ok(Err(e)) => {
                warn!(
                    "Relay connection from {} closed during authorization: {}",
                    peer, e
                );
                return;
            }
            Err(_) => {
                warn!(
                    "Relay connection from {} did not authorize within {:?}, closing",
                    peer, shared.config.relay_timeout
                );
                return;
            }
        }
    }

    shared.queues.enqueue(key, stream).await;
}

async fn handle_public_conn(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    if let Err(e) = set_keep_alive(&tcp) {
        warn!("Failed to enable keep-alive for {}: {}", peer, e);
    }

    let stream = match upgrade(tcp, acceptor).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TLS handshake failed on public leg from {}: {}", peer, e);
            return;
        }
    };

    if !pinned_cn_matches(&stream, shared.config.public_cert_cn.as_deref()) {
        warn!(
            "Public connection from {} does not match the pinned certificate common name, closing",
            peer
        );
        return;
    }

    let Some(key) = resolve_identity(&stream, shared.config.public_tls.as_ref(), &shared.config)
    else {
        warn!(
            "Public connection from {} has no client certificate identity, closing",
            peer
        );
        return;
    };

    match shared.queues.take(&key, shared.config.public_timeout).await {
        Some(relay_stream) => {
            let id = next_pipe_id();
            info!(
                "[broker:{}] paired public connection from {} with tunnel '{}'",
                id, peer, key
            );
            forward_pair(relay_stream, stream, id, cancel).await;
        }
        None => {
            warn!(
                "No relay connection for tunnel '{}' within {:?}, closing public connection from {}",
                key, shared.config.public_timeout, peer
            );
        }
    }
}
