//! End-to-end tests for the proxy pipeline.
//!
//! Each test starts a [`Proxy`] on a loopback listener, a loopback target
//! server, and drives a client through the public API. Tests skip when the
//! environment forbids binding sockets.
//!
//! # Running
//!
//! ```bash
//! cargo test -p warden-proxy --test pipeline_test
//! ```

#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use warden_proxy::{
    ChannelStream, DirectDialer, Event, IpList, ListKind, ListSource, Preamble, PreambleSniffer,
    Proxy, ProxyOpts, StableBloomFilter, DEFAULT_TIME_SKEW,
};

// ============================================================================
// Infrastructure
// ============================================================================

const SECRET: &[u8] = b"integration-secret-0123456789abcd";

async fn tcp_listener_or_skip() -> Option<TcpListener> {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => Some(listener),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
        Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
    }
}

fn base_opts() -> (ProxyOpts, mpsc::Receiver<Event>) {
    let (stream, rx) = ChannelStream::new(4096);
    let mut opts = ProxyOpts::new(
        Arc::new(DirectDialer::default()),
        Arc::new(PreambleSniffer::new(SECRET.to_vec(), DEFAULT_TIME_SKEW).unwrap()),
    );
    opts.event_stream = Arc::new(stream);
    opts.handshake_timeout = Duration::from_secs(2);
    (opts, rx)
}

struct Running {
    proxy: Arc<Proxy>,
    addr: SocketAddr,
    serving: tokio::task::JoinHandle<warden_proxy::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.proxy.shutdown().await;
        self.serving.await.unwrap().unwrap();
    }
}

async fn start(opts: ProxyOpts) -> Option<Running> {
    let listener = tcp_listener_or_skip().await?;
    let addr = listener.local_addr().unwrap();
    let proxy = Arc::new(Proxy::new(opts).unwrap());
    let serving = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.serve(listener).await })
    };
    Some(Running {
        proxy,
        addr,
        serving,
    })
}

fn preamble_for(target: SocketAddr) -> Vec<u8> {
    Preamble::seal(SECRET, &target.to_string(), SystemTime::now()).unwrap()
}

/// Read until EOF or error; true if the peer closed without sending data.
async fn closed_without_data(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

async fn collect_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_bytes_flow_both_ways_and_close_propagates() {
    let Some(target) = tcp_listener_or_skip().await else {
        return;
    };
    let target_addr = target.local_addr().unwrap();
    let (opts, mut rx) = base_opts();
    let Some(running) = start(opts).await else {
        return;
    };

    let upstream_side = tokio::spawn(async move {
        let (mut conn, _) = target.accept().await.unwrap();
        let mut request = [0u8; 12];
        conn.read_exact(&mut request).await.unwrap();
        conn.write_all(b"pong from target").await.unwrap();

        // The client closes next; the relay must pass the EOF on.
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        (request, rest)
    });

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut send = preamble_for(target_addr);
    send.extend_from_slice(b"ping from me");
    client.write_all(&send).await.unwrap();

    let mut reply = [0u8; 16];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong from target");

    client.shutdown().await.unwrap();
    let (request, rest) = tokio::time::timeout(Duration::from_secs(3), upstream_side)
        .await
        .expect("target should see EOF")
        .unwrap();
    assert_eq!(&request, b"ping from me");
    assert!(rest.is_empty());

    let events = collect_events(&mut rx).await;
    let upstream_bytes: usize = events
        .iter()
        .filter_map(|e| match e {
            Event::Traffic {
                bytes,
                direction: warden_proxy::Direction::Upstream,
                ..
            } => Some(*bytes),
            _ => None,
        })
        .sum();
    assert_eq!(upstream_bytes, 12);
    assert!(events.iter().any(|e| matches!(e, Event::Connected { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::Finish { .. })));

    running.stop().await;
}

// ============================================================================
// Access Control
// ============================================================================

#[tokio::test]
async fn test_blocklisted_client_is_closed_without_dial() {
    let Some(target) = tcp_listener_or_skip().await else {
        return;
    };
    let target_addr = target.local_addr().unwrap();

    let blocklist = IpList::new(
        ListKind::Blocklist,
        vec![ListSource::Memory(vec!["127.0.0.0/8".parse().unwrap()])],
        reqwest::Client::new(),
        1,
    );
    blocklist.refresh().await.unwrap();

    let (mut opts, mut rx) = base_opts();
    opts.blocklist = Arc::new(blocklist);
    let Some(running) = start(opts).await else {
        return;
    };

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    // The proxy may already have closed the socket.
    let _ = client.write_all(&preamble_for(target_addr)).await;
    assert!(closed_without_data(&mut client).await);

    let dialed = tokio::time::timeout(Duration::from_millis(300), target.accept()).await;
    assert!(dialed.is_err(), "blocklisted client must not cause a dial");

    let events = collect_events(&mut rx).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::IpBlocklisted { .. })));
    assert!(!events.iter().any(|e| matches!(e, Event::Start { .. })));

    running.stop().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_set() {
    let mut good = tempfile::NamedTempFile::new().unwrap();
    writeln!(good, "127.0.0.0/8").unwrap();
    let mut second = tempfile::NamedTempFile::new().unwrap();
    writeln!(second, "10.0.0.0/8").unwrap();

    let list = IpList::new(
        ListKind::Blocklist,
        vec![
            ListSource::File(good.path().to_path_buf()),
            ListSource::File(second.path().to_path_buf()),
        ],
        reqwest::Client::new(),
        2,
    );
    list.refresh().await.unwrap();
    let before = list.snapshot();

    // One of two sources breaks; the other would have changed the set.
    std::fs::write(good.path(), "192.168.0.0/16\n").unwrap();
    std::fs::write(second.path(), "10.0.0.0/8\nthis is not a network\n").unwrap();
    list.refresh().await.unwrap_err();

    assert_eq!(*list.snapshot(), *before);
    assert!(list.contains("127.0.0.1".parse().unwrap()));
    assert!(!list.contains("192.168.1.1".parse().unwrap()));
}

// ============================================================================
// Anti-Replay
// ============================================================================

#[tokio::test]
async fn test_replayed_handshake_is_rejected_second_time() {
    let Some(target) = tcp_listener_or_skip().await else {
        return;
    };
    let target_addr = target.local_addr().unwrap();
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = target.accept().await {
                accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
    }

    let (mut opts, mut rx) = base_opts();
    opts.anti_replay = Arc::new(StableBloomFilter::new(1 << 16, 0.0001).unwrap());
    let Some(running) = start(opts).await else {
        return;
    };

    let mut send = preamble_for(target_addr);
    send.extend_from_slice(b"echo");

    let mut first = TcpStream::connect(running.addr).await.unwrap();
    first.write_all(&send).await.unwrap();
    let mut back = [0u8; 4];
    first.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"echo");

    let mut second = TcpStream::connect(running.addr).await.unwrap();
    let _ = second.write_all(&send).await;
    assert!(closed_without_data(&mut second).await);

    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    let events = collect_events(&mut rx).await;
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::ReplayAttack { .. }))
            .count(),
        1
    );

    drop(first);
    running.stop().await;
}
