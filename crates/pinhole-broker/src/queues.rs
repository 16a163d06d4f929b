//! Per-identity FIFO queues of authorized relay connections

use crate::config::TunnelKey;
use pinhole_transport::RelayStream;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Authorized relay connections awaiting pairing, FIFO per tunnel identity.
///
/// The mutex is only held across queue mutation, never across an await.
#[derive(Default)]
pub struct TunnelQueues {
    queues: Mutex<HashMap<TunnelKey, VecDeque<RelayStream>>>,
    available: Notify,
}

impl TunnelQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an authorized relay connection for its tunnel identity
    pub async fn enqueue(&self, key: TunnelKey, stream: RelayStream) {
        {
            let mut queues = self.queues.lock().await;
            queues.entry(key.clone()).or_default().push_back(stream);
        }
        debug!("Queued relay connection for tunnel '{}'", key);
        self.available.notify_waiters();
    }

    /// Take the oldest queued relay connection for `key`, waiting up to
    /// `wait` for one to arrive. `None` on timeout.
    pub async fn take(&self, key: &TunnelKey, wait: Duration) -> Option<RelayStream> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Arm the waiter before checking the queue so an enqueue between
            // the check and the await cannot be missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stream) = self.pop(key).await {
                return Some(stream);
            }

            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Number of queued relay connections for `key`
    pub async fn queued(&self, key: &TunnelKey) -> usize {
        self.queues
            .lock()
            .await
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    async fn pop(&self, key: &TunnelKey) -> Option<RelayStream> {
        self.queues.lock().await.get_mut(key)?.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    async fn stream_pair() -> (RelayStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (RelayStream::Tcp(server), client)
    }

    #[tokio::test]
    async fn test_fifo_order_within_identity() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let queues = TunnelQueues::new();
        let key = TunnelKey::shared();

        let (first, mut first_peer) = stream_pair().await;
        let (second, _second_peer) = stream_pair().await;
        queues.enqueue(key.clone(), first).await;
        queues.enqueue(key.clone(), second).await;
        assert_eq!(queues.queued(&key).await, 2);

        // The oldest queued connection comes out first
        let mut taken = queues
            .take(&key, Duration::from_millis(100))
            .await
            .unwrap();
        taken.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        first_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        assert_eq!(queues.queued(&key).await, 1);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let queues = TunnelQueues::new();
        let tenant_a = TunnelKey::new("tenant-a");
        let tenant_b = TunnelKey::new("tenant-b");

        let (stream, _peer) = stream_pair().await;
        queues.enqueue(tenant_a.clone(), stream).await;

        // A connection queued for tenant-a must never pair with tenant-b
        assert!(queues
            .take(&tenant_b, Duration::from_millis(50))
            .await
            .is_none());
        assert!(queues
            .take(&tenant_a, Duration::from_millis(50))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_take_times_out_when_empty() {
        let queues = TunnelQueues::new();
        let key = TunnelKey::shared();

        let start = tokio::time::Instant::now();
        let taken = queues.take(&key, Duration::from_millis(100)).await;
        assert!(taken.is_none());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_waiting_take_sees_late_enqueue() {
        let queues = Arc::new(TunnelQueues::new());
        let key = TunnelKey::shared();

        let waiter = {
            let queues = queues.clone();
            let key = key.clone();
            tokio::spawn(async move { queues.take(&key, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (stream, _peer) = stream_pair().await;
        queues.enqueue(key, stream).await;

        let taken = waiter.await.unwrap();
        assert!(taken.is_some());
    }
}
