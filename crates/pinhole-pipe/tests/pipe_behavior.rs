//! Behavioral tests for the socket pipe state machine
//!
//! Each test stands up plain TCP listeners playing the broker and target
//! roles and drives a real pipe against them.

use bytes::Bytes;
use pinhole_pipe::{PipeConfig, PipeEvent, PipeRole, SocketPipe};
use pinhole_transport::TransportSecurityConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn pipe_config(relay_port: u16, target_port: u16, secret: Option<&'static [u8]>) -> PipeConfig {
    PipeConfig {
        target_host: "127.0.0.1".to_string(),
        target_port,
        relay_host: "127.0.0.1".to_string(),
        relay_port,
        relay_security: TransportSecurityConfig::plaintext(),
        target_security: TransportSecurityConfig::plaintext(),
        relay_secret: secret.map(Bytes::from_static),
    }
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn secret_then_payload_reaches_target() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = target.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(
        pipe_config(broker_port, target_port, Some(b"abc123")),
        PipeRole::Relay,
        tx,
    );

    // Broker side: the authorization secret must be the first bytes on the wire
    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    let mut secret = [0u8; 6];
    timeout(WAIT, relay_conn.read_exact(&mut secret))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&secret, b"abc123");

    // First data on the relay leg triggers pairing
    relay_conn.write_all(b"0123456789").await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, PipeEvent::Paired { id: pipe.id() });

    // Target sees the payload intact
    let (mut target_conn, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    let mut payload = [0u8; 10];
    timeout(WAIT, target_conn.read_exact(&mut payload))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&payload, b"0123456789");

    pipe.terminate();
}

#[tokio::test]
async fn chunks_arrive_concatenated_in_order() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = target.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();

    // Several chunks in quick succession, some of them landing while the
    // target leg is still being established
    for chunk in [&b"alpha "[..], b"beta ", b"gamma ", b"delta"] {
        relay_conn.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, PipeEvent::Paired { .. }));

    let (mut target_conn, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    let mut received = vec![0u8; 22];
    timeout(WAIT, target_conn.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"alpha beta gamma delta");

    pipe.terminate();
}

#[tokio::test]
async fn forwarding_is_bidirectional() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = target.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    relay_conn.write_all(b"request").await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, PipeEvent::Paired { .. }));

    let (mut target_conn, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    let mut request = [0u8; 7];
    timeout(WAIT, target_conn.read_exact(&mut request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&request, b"request");

    // Response flows target -> relay
    target_conn.write_all(b"response").await.unwrap();
    let mut response = [0u8; 8];
    timeout(WAIT, relay_conn.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"response");

    pipe.terminate();
}

#[tokio::test]
async fn broker_close_before_pairing_emits_unpaired_closed() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = unused_port().await;
    let broker_port = broker.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let (relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    drop(relay_conn);

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        PipeEvent::Closed {
            id: pipe.id(),
            paired: false
        }
    );
}

#[tokio::test]
async fn unreachable_broker_emits_unpaired_closed() {
    let broker_port = unused_port().await;
    let target_port = unused_port().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        PipeEvent::Closed {
            id: pipe.id(),
            paired: false
        }
    );
}

#[tokio::test]
async fn target_connect_failure_closes_paired_pipe() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = unused_port().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    relay_conn.write_all(b"data").await.unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, PipeEvent::Paired { id: pipe.id() });

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        PipeEvent::Closed {
            id: pipe.id(),
            paired: true
        }
    );
}

#[tokio::test]
async fn terminate_is_idempotent_and_silent() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = unused_port().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(
        pipe_config(broker_port, target_port, None),
        PipeRole::Relay,
        tx.clone(),
    );

    let (_relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();

    pipe.terminate();
    pipe.terminate();

    // A terminated pipe emits no further events
    let quiet = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(quiet.is_err(), "expected no event after terminate");
}

#[tokio::test]
async fn terminated_pipe_drops_relay_leg() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = unused_port().await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    pipe.terminate();

    // The broker side observes EOF once the pipe tears down
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, relay_conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn large_payload_passes_through_unmodified() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let target_port = target.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = SocketPipe::spawn(pipe_config(broker_port, target_port, None), PipeRole::Relay, tx);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut relay_conn, _) = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    let writer = tokio::spawn(async move {
        relay_conn.write_all(&payload).await.unwrap();
        relay_conn.flush().await.unwrap();
        relay_conn
    });

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, PipeEvent::Paired { .. }));

    let (mut target_conn, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, target_conn.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);

    let _relay_conn: TcpStream = writer.await.unwrap();
    pipe.terminate();
}
