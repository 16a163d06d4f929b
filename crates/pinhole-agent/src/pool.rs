//! Connection pool driving the pending relay pipes

use crate::config::{AgentConfig, AgentError};
use pinhole_pipe::{PipeEvent, PipeId, PipeRole, SocketPipe};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle for terminating a running agent from another task
#[derive(Debug, Clone)]
pub struct AgentHandle {
    cancel: CancellationToken,
}

impl AgentHandle {
    /// Stop replenishment and terminate every tracked pipe. Idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

/// Tunnel agent owning the pool of socket pipes
pub struct Agent {
    config: AgentConfig,
    pipes: HashMap<PipeId, SocketPipe>,
    events_tx: mpsc::UnboundedSender<PipeEvent>,
    events_rx: mpsc::UnboundedReceiver<PipeEvent>,
    replenish_tx: mpsc::UnboundedSender<()>,
    replenish_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replenish_tx, replenish_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            pipes: HashMap::new(),
            events_tx,
            events_rx,
            replenish_tx,
            replenish_rx,
            cancel: CancellationToken::new(),
        })
    }

    /// Handle for terminating the agent from another task
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Number of pipes currently tracked (pending and paired)
    pub fn tracked_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Create the initial set of pending pipes
    pub fn start(&mut self) {
        info!(
            "Starting tunnel agent: {} pending connection(s) to relay {}:{}, target {}:{}",
            self.config.relay_num_conn,
            self.config.relay_host,
            self.config.relay_port,
            self.config.target_host,
            self.config.target_port
        );

        for _ in 0..self.config.relay_num_conn {
            self.create_pipe();
        }
    }

    /// Drive pipe events and replenishment until terminated
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Terminating tunnel agent and {} pipe(s)", self.pipes.len());
                    for pipe in self.pipes.values() {
                        pipe.terminate();
                    }
                    self.pipes.clear();
                    return;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
                Some(()) = self.replenish_rx.recv() => {
                    debug!("Replenishing relay connection after delay");
                    self.create_pipe();
                }
            }
        }
    }

    fn handle_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Paired { id } => {
                // The paired pipe keeps forwarding in the background; top up
                // the pending quota right away
                debug!("Pipe {} paired, creating replacement pending pipe", id);
                self.create_pipe();
            }
            PipeEvent::Closed { id, paired } => {
                self.pipes.remove(&id);
                if paired {
                    debug!("Paired pipe {} finished", id);
                } else {
                    // Broker dropped the connection before pairing; back off
                    // before re-dialing
                    debug!(
                        "Pending pipe {} closed by remote, scheduling replacement in {:?}",
                        id, self.config.replenish_delay
                    );
                    self.schedule_replenish();
                }
            }
        }
    }

    fn create_pipe(&mut self) {
        let pipe = SocketPipe::spawn_linked(
            self.config.pipe_config(),
            PipeRole::Relay,
            self.events_tx.clone(),
            &self.cancel,
        );
        self.pipes.insert(pipe.id(), pipe);
    }

    fn schedule_replenish(&self) {
        let tx = self.replenish_tx.clone();
        let cancel = self.cancel.clone();
        let delay = self.config.replenish_delay;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(());
                }
            }
        });
    }
}
