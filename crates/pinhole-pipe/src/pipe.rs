//! Socket pipe state machine

use crate::buffer::PendingBuffer;
use bytes::{Bytes, BytesMut};
use pinhole_transport::{connect, RelayStream, TransportSecurityConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process-wide pipe id, monotonically increasing
pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next pipe id
pub fn next_pipe_id() -> PipeId {
    NEXT_PIPE_ID.fetch_add(1, Ordering::SeqCst)
}

/// Which side of the tunnel owns this pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    /// Agent side: dials the relay and the private target
    Relay,
    /// Broker side: joins an accepted relay leg with an accepted public leg
    Broker,
}

impl std::fmt::Display for PipeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeRole::Relay => write!(f, "relay"),
            PipeRole::Broker => write!(f, "broker"),
        }
    }
}

/// Endpoints and options for an agent-side pipe
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub target_host: String,
    pub target_port: u16,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_security: TransportSecurityConfig,
    pub target_security: TransportSecurityConfig,
    /// Raw bytes written verbatim as the first write on the relay leg
    pub relay_secret: Option<Bytes>,
}

/// Lifecycle notifications a pipe sends to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// The relay leg received its first data and the target dial started.
    /// The owner should provision a replacement pending pipe.
    Paired { id: PipeId },
    /// The pipe finished. `paired == false` means the relay leg went down
    /// before any pairing happened (the owner should schedule a delayed
    /// replacement); `paired == true` means a forwarding session ended.
    Closed { id: PipeId, paired: bool },
}

/// Handle to a running pipe task
#[derive(Debug)]
pub struct SocketPipe {
    id: PipeId,
    role: PipeRole,
    cancel: CancellationToken,
}

impl SocketPipe {
    /// Start a new pending pipe. Dialing happens on a spawned task; this
    /// never blocks the caller.
    pub fn spawn(
        config: PipeConfig,
        role: PipeRole,
        events: mpsc::UnboundedSender<PipeEvent>,
    ) -> Self {
        Self::spawn_inner(config, role, events, CancellationToken::new())
    }

    /// Like [`SocketPipe::spawn`], but the pipe's lifetime is tied to
    /// `parent`: cancelling the parent token terminates the pipe.
    pub fn spawn_linked(
        config: PipeConfig,
        role: PipeRole,
        events: mpsc::UnboundedSender<PipeEvent>,
        parent: &CancellationToken,
    ) -> Self {
        Self::spawn_inner(config, role, events, parent.child_token())
    }

    fn spawn_inner(
        config: PipeConfig,
        role: PipeRole,
        events: mpsc::UnboundedSender<PipeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let id = next_pipe_id();

        debug!("[{}:{}] created pending socket pipe", role, id);

        tokio::spawn(run_pipe(id, role, config, events, cancel.clone()));

        Self { id, role, cancel }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn role(&self) -> PipeRole {
        self.role
    }

    /// Forcibly close both legs and stop emitting events. Idempotent.
    pub fn terminate(&self) {
        debug!("[{}:{}] terminating socket pipe", self.role, self.id);
        self.cancel.cancel();
    }
}

async fn run_pipe(
    id: PipeId,
    role: PipeRole,
    config: PipeConfig,
    events: mpsc::UnboundedSender<PipeEvent>,
    cancel: CancellationToken,
) {
    // Relay leg: dial, then authorize
    let mut relay = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect(&config.relay_host, config.relay_port, &config.relay_security) => {
            match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[{}:{}] relay connect to {}:{} failed: {}",
                        role, id, config.relay_host, config.relay_port, e);
                    let _ = events.send(PipeEvent::Closed { id, paired: false });
                    return;
                }
            }
        }
    };

    debug!(
        "[{}:{}] relay leg connected to {}:{}",
        role, id, config.relay_host, config.relay_port
    );

    if let Some(secret) = &config.relay_secret {
        debug!("[{}:{}] sending authorization to relay", role, id);
        if let Err(e) = write_all_flushed(&mut relay, secret).await {
            warn!("[{}:{}] error writing authorization: {}", role, id, e);
            let _ = events.send(PipeEvent::Closed { id, paired: false });
            return;
        }
    }

    // Pending: wait for the first data on the relay leg
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let first_chunk = tokio::select! {
        _ = cancel.cancelled() => return,
        result = read_chunk(&mut relay, &mut read_buf, role, id) => {
            match result {
                Some(chunk) => chunk,
                None => {
                    // Remote closed the connection before pairing
                    debug!("[{}:{}] relay leg closed before pairing", role, id);
                    let _ = events.send(PipeEvent::Closed { id, paired: false });
                    return;
                }
            }
        }
    };

    let mut buffer = PendingBuffer::new();
    buffer.push(first_chunk);

    debug!(
        "[{}:{}] paired; connecting to target {}:{}",
        role, id, config.target_host, config.target_port
    );
    let _ = events.send(PipeEvent::Paired { id });

    // Target dialing: keep reading and buffering relay chunks in arrival
    // order while the dial is in flight
    let dial = connect(
        &config.target_host,
        config.target_port,
        &config.target_security,
    );
    tokio::pin!(dial);

    let mut target = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = &mut dial => {
                match result {
                    Ok(stream) => break stream,
                    Err(e) => {
                        warn!("[{}:{}] target connect to {}:{} failed: {}",
                            role, id, config.target_host, config.target_port, e);
                        let _ = events.send(PipeEvent::Closed { id, paired: true });
                        return;
                    }
                }
            }
            result = read_chunk(&mut relay, &mut read_buf, role, id) => {
                match result {
                    Some(chunk) => buffer.push(chunk),
                    None => {
                        debug!("[{}:{}] relay leg closed while target was connecting", role, id);
                        let _ = events.send(PipeEvent::Closed { id, paired: true });
                        return;
                    }
                }
            }
        }
    };

    debug!(
        "[{}:{}] target leg connected; draining {} buffered chunk(s)",
        role,
        id,
        buffer.len()
    );

    for chunk in buffer.drain() {
        if let Err(e) = target.write_all(&chunk).await {
            warn!("[{}:{}] error writing buffered data to target: {}", role, id, e);
            let _ = events.send(PipeEvent::Closed { id, paired: true });
            return;
        }
    }
    if let Err(e) = target.flush().await {
        warn!("[{}:{}] error flushing target leg: {}", role, id, e);
        let _ = events.send(PipeEvent::Closed { id, paired: true });
        return;
    }

    // Steady state: bidirectional forwarding until either leg closes
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut relay, &mut target) => {
            match result {
                Ok((to_target, to_relay)) => debug!(
                    "[{}:{}] session finished: {} bytes to target, {} bytes to relay",
                    role, id, to_target, to_relay
                ),
                Err(e) => debug!("[{}:{}] session closed: {}", role, id, e),
            }
            let _ = events.send(PipeEvent::Closed { id, paired: true });
        }
    }
}

/// Forward bytes between two established legs until either closes.
///
/// Broker-side counterpart of the agent pipe's steady state: both legs were
/// accepted rather than dialed, so there is no pending phase.
pub async fn forward_pair(
    mut relay: RelayStream,
    mut public: RelayStream,
    id: PipeId,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("[broker:{}] pairing terminated", id);
        }
        result = tokio::io::copy_bidirectional(&mut relay, &mut public) => {
            match result {
                Ok((to_public, to_relay)) => debug!(
                    "[broker:{}] pairing finished: {} bytes to public, {} bytes to relay",
                    id, to_public, to_relay
                ),
                Err(e) => debug!("[broker:{}] pairing closed: {}", id, e),
            }
        }
    }
}

/// Read one chunk; `None` on EOF or read error (both end the pipe)
async fn read_chunk(
    stream: &mut RelayStream,
    buf: &mut BytesMut,
    role: PipeRole,
    id: PipeId,
) -> Option<Bytes> {
    use tokio::io::AsyncReadExt;
    match stream.read_buf(buf).await {
        Ok(0) => None,
        Ok(_) => Some(buf.split().freeze()),
        Err(e) => {
            debug!("[{}:{}] relay leg read error: {}", role, id, e);
            None
        }
    }
}

async fn write_all_flushed(stream: &mut RelayStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}
