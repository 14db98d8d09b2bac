//! End-to-end forwarding tests over loopback sockets.

use portfwd_core::{
    ChannelSink, Event, ForwardingManager, FwdError, ManagerOptions, Rule, Snapshot,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Echo server on an ephemeral port.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A loopback address nothing is listening on.
fn unused_addr() -> String {
    let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    scratch.local_addr().unwrap().to_string()
}

fn manager(options: ManagerOptions) -> (Arc<ForwardingManager>, UnboundedReceiver<Event>) {
    let (sink, rx) = ChannelSink::new();
    (
        Arc::new(ForwardingManager::new(Arc::new(sink), options)),
        rx,
    )
}

fn blob(rules: Vec<Rule>) -> Vec<u8> {
    Snapshot::new(rules).to_json().unwrap().into_bytes()
}

async fn wait_for_listeners(manager: &ForwardingManager, n: usize) {
    timeout(WAIT, async {
        while manager.active_listeners().len() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listeners did not come up");
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("no event")
        .expect("sink closed")
}

/// Connect to `addr` and drop the connection with an RST instead of a FIN.
async fn reset_connection(addr: &str) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    if let Ok(stream) = socket.connect(addr.parse().unwrap()).await {
        drop(stream);
    }
}

async fn roundtrip(addr: &str, payload: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
    client
}

#[tokio::test]
async fn test_reapplying_same_config_is_idempotent() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let (a, b) = (unused_addr(), unused_addr());
    let config = blob(vec![
        Rule::new(a.clone(), echo.to_string()),
        Rule::new(b.clone(), echo.to_string()),
    ]);

    assert_eq!(manager.apply(&config).await.unwrap(), 2);
    wait_for_listeners(&manager, 2).await;
    let mut first = manager.active_listeners();
    first.sort();

    assert_eq!(manager.apply(&config).await.unwrap(), 2);
    wait_for_listeners(&manager, 2).await;
    let mut second = manager.active_listeners();
    second.sort();

    assert_eq!(first, second);
    assert_eq!(manager.sockets().len(), 2);
    roundtrip(&a, b"hello").await;
    roundtrip(&b, b"world").await;
}

#[tokio::test]
async fn test_back_to_back_applies_leave_one_listener_per_rule() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    let config = blob(vec![Rule::new(local.clone(), echo.to_string())]);

    for _ in 0..5 {
        manager.apply(&config).await.unwrap();
    }
    wait_for_listeners(&manager, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.active_listeners().len(), 1);
    roundtrip(&local, b"ok").await;
}

#[tokio::test]
async fn test_listen_failure_is_isolated_to_its_rule() {
    let echo = echo_server().await;
    let (manager, mut rx) = manager(ManagerOptions::default());
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let occupied_addr = occupied.local_addr().unwrap().to_string();
    let free = unused_addr();

    manager
        .apply(&blob(vec![
            Rule::new(occupied_addr, echo.to_string()),
            Rule::new(free.clone(), echo.to_string()),
        ]))
        .await
        .unwrap();

    match next_event(&mut rx).await {
        Event::ListenError { index, message } => {
            assert_eq!(index, 0);
            assert!(!message.is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_listeners(&manager, 1).await;
    assert_eq!(
        manager.active_listeners()[0].to_string(),
        free,
        "only the second rule should be listening"
    );

    let client = roundtrip(&free, b"still works").await;
    drop(client);
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, Event::ListenError { .. }),
            "extra listen error {event:?}"
        );
    }
}

#[tokio::test]
async fn test_dial_failure_keeps_listener_serving() {
    let (manager, mut rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    let refused = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), refused)]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(&local).await.unwrap();
        match next_event(&mut rx).await {
            Event::ConnectError { index, .. } => assert_eq!(index, 0),
            other => panic!("unexpected event {other:?}"),
        }

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "accepted connection should be closed");
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "one event per failed dial");
    assert_eq!(manager.active_listeners().len(), 1);
    assert!(manager.registry().conns().is_empty());
}

#[tokio::test]
async fn test_empty_config_tears_everything_down() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let (a, b) = (unused_addr(), unused_addr());
    manager
        .apply(&blob(vec![
            Rule::new(a.clone(), echo.to_string()),
            Rule::new(b.clone(), echo.to_string()),
        ]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 2).await;
    let mut open_tunnel = roundtrip(&a, b"live").await;
    assert!(!manager.registry().conns().is_empty());

    assert_eq!(manager.apply(br#"{"forwards":[]}"#).await.unwrap(), 0);
    assert!(manager.registry().is_empty());
    assert!(manager.active_listeners().is_empty());

    for addr in [&a, &b] {
        TcpListener::bind(addr.as_str())
            .await
            .unwrap_or_else(|e| panic!("{addr} still in use: {e}"));
    }

    let mut buf = [0u8; 1];
    let n = timeout(WAIT, open_tunnel.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "open tunnel should be closed by the reset");

    timeout(WAIT, async {
        while !manager.sockets().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_disabled_rules_start_nothing() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let config = blob(vec![
        Rule::new(unused_addr(), echo.to_string()).disabled(),
        Rule::new(unused_addr(), echo.to_string()).disabled(),
    ]);
    assert_eq!(manager.apply(&config).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.active_listeners().is_empty());
    assert_eq!(manager.current_snapshot().unwrap().forwards.len(), 2);
}

#[tokio::test]
async fn test_counts_sequential_tunnels() {
    let echo = echo_server().await;
    let (manager, mut rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    manager
        .apply(&blob(vec![
            Rule::new(unused_addr(), echo.to_string()).disabled(),
            Rule::new(local.clone(), echo.to_string()),
        ]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    let mut seen = Vec::new();
    for n in 1..=3u64 {
        let client = roundtrip(&local, b"count me").await;
        seen.push(next_event(&mut rx).await);
        drop(client);
        seen.push(next_event(&mut rx).await);
        assert_eq!(
            seen.last(),
            Some(&Event::ConnectionCount {
                index: 1,
                current: 0,
                total: n
            })
        );
    }

    let expected: Vec<Event> = (1..=3u64)
        .flat_map(|n| {
            [
                Event::ConnectionCount {
                    index: 1,
                    current: 1,
                    total: n,
                },
                Event::ConnectionCount {
                    index: 1,
                    current: 0,
                    total: n,
                },
            ]
        })
        .collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_counting_can_be_disabled() {
    let echo = echo_server().await;
    let (manager, mut rx) = manager(ManagerOptions {
        track_activity: false,
    });
    let local = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    drop(roundtrip(&local, b"quiet").await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reset_freezes_counters() {
    let echo = echo_server().await;
    let (manager, mut rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    let _client = roundtrip(&local, b"x").await;
    assert!(matches!(
        next_event(&mut rx).await,
        Event::ConnectionCount { current: 1, .. }
    ));

    manager.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no updates after teardown");
}

#[tokio::test]
async fn test_malformed_config_leaves_nothing_running() {
    let echo = echo_server().await;
    let (manager, mut rx) = manager(ManagerOptions::default());
    manager
        .apply(&blob(vec![Rule::new(unused_addr(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    let err = manager.apply(b"{\"forwards\": [{]").await.unwrap_err();
    assert!(matches!(err, FwdError::ConfigParse(_)));
    assert!(manager.active_listeners().is_empty());
    assert!(manager.current_snapshot().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.active_listeners().is_empty());
    assert!(rx.try_recv().is_err(), "parse failures produce no events");
}

#[tokio::test]
async fn test_bytes_arrive_unchanged() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    let mut state: u32 = 0x2545_f491;
    let payload: Vec<u8> = (0..512 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect();

    let client = TcpStream::connect(&local).await.unwrap();
    let (mut read, mut write) = client.into_split();
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        write.write_all(&sent).await.unwrap();
        write
    });

    let mut received = vec![0u8; payload.len()];
    timeout(WAIT, read.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    let _write = writer.await.unwrap();
    assert!(received == payload, "payload corrupted in transit");
}

#[tokio::test]
async fn test_reset_clients_do_not_stop_listener() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    for _ in 0..200 {
        reset_connection(&local).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.active_listeners().len(), 1);
    roundtrip(&local, b"after resets").await;
}

#[tokio::test]
async fn test_client_reset_mid_tunnel_closes_only_that_tunnel() {
    let echo = echo_server().await;
    let (manager, _rx) = manager(ManagerOptions::default());
    let local = unused_addr();
    manager
        .apply(&blob(vec![Rule::new(local.clone(), echo.to_string())]))
        .await
        .unwrap();
    wait_for_listeners(&manager, 1).await;

    let mut survivor = roundtrip(&local, b"first").await;

    let socket = TcpSocket::new_v4().unwrap();
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    let mut doomed = socket.connect(local.parse().unwrap()).await.unwrap();
    doomed.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    timeout(WAIT, doomed.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    drop(doomed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.active_listeners().len(), 1);
    survivor.write_all(b"still").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, survivor.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"still");
    roundtrip(&local, b"new tunnel").await;
}

#[tokio::test]
async fn test_apply_does_not_wait_for_host_held_listener() {
    let (manager, _rx) = manager(ManagerOptions::default());
    let held = manager.sockets().listen("127.0.0.1:0").await.unwrap();

    timeout(Duration::from_secs(2), manager.apply(br#"{"forwards":[]}"#))
        .await
        .expect("apply blocked on a listener it does not own")
        .unwrap();
    assert!(held.handle().is_closed());
}
