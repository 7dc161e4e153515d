//! End-to-end protocol scenarios over loopback UDP: handshakes, loss
//! recovery, datagram truncation, timeouts and graceful close.

use async_trait::async_trait;
use rudt::{Config, HandshakeInfo, HandshakeListener, Multiplexer, SocketState, UdtConnection};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A minimal listener surface: accepts the first request per peer, hands the
///  new connection to the test, and routes repeated requests back to it.
struct Acceptor {
    mux: Arc<Multiplexer>,
    accepted: mpsc::Sender<UdtConnection>,
    seen: parking_lot::Mutex<HashMap<(SocketAddr, u32), UdtConnection>>,
}

#[async_trait]
impl HandshakeListener for Acceptor {
    async fn on_handshake(&self, hs: HandshakeInfo, from: SocketAddr) {
        let key = (from, hs.conn_id);
        if let Some(existing) = self.seen.lock().get(&key) {
            existing.handle_handshake(hs);
            return;
        }
        let conn = self.mux.accept(hs, from).expect("accepting a valid request");
        self.seen.lock().insert(key, conn.clone());
        let _ = self.accepted.send(conn).await;
    }
}

async fn listening_mux(config: Config) -> (Arc<Multiplexer>, mpsc::Receiver<UdtConnection>) {
    let mux = Multiplexer::bind(localhost(), config).await.expect("bind server");
    let (accepted_tx, accepted_rx) = mpsc::channel(4);
    assert!(mux.set_listener(Arc::new(Acceptor {
        mux: mux.clone(),
        accepted: accepted_tx,
        seen: parking_lot::Mutex::new(HashMap::new()),
    })));
    (mux, accepted_rx)
}

/// Connects a client to a freshly bound server, returning both halves.
async fn connected_pair(config: Config) -> (UdtConnection, UdtConnection) {
    let (server_mux, mut accepted_rx) = listening_mux(config.clone()).await;
    let client_mux = Multiplexer::bind(localhost(), config).await.expect("bind client");

    let client = client_mux.new_client(server_mux.local_addr()).expect("start client");
    client.wait_connected().await.expect("client handshake");
    let server = accepted_rx.recv().await.expect("server accepted");
    server.wait_connected().await.expect("server side up");
    (client, server)
}

fn stream_config() -> Config {
    Config { datagram: false, linger: Duration::from_secs(5), ..Config::default() }
}

async fn read_exact(conn: &UdtConnection, total: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(total);
    let mut buf = vec![0u8; 16 * 1024];
    while collected.len() < total {
        let n = conn.read(&mut buf).await.expect("read while data pending");
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }
    collected
}

#[tokio::test(flavor = "multi_thread")]
async fn three_way_handshake_and_transfer() {
    let (client, server) = connected_pair(stream_config()).await;
    assert_eq!(client.state(), SocketState::Connected);
    assert_eq!(server.state(), SocketState::Connected);

    client.write(b"ping from the client").await.expect("client write");
    let received = read_exact(&server, 20).await;
    assert_eq!(&received, b"ping from the client");

    server.write(b"pong").await.expect("server write");
    let received = read_exact(&client, 4).await;
    assert_eq!(&received, b"pong");

    client.close().await.expect("close client");
    server.close().await.expect("close server");
}

#[tokio::test(flavor = "multi_thread")]
async fn rendezvous_handshake() {
    let mux_a = Multiplexer::bind(localhost(), stream_config()).await.expect("bind a");
    let mux_b = Multiplexer::bind(localhost(), stream_config()).await.expect("bind b");

    let conn_a = mux_a.new_rendezvous(mux_b.local_addr()).expect("start a");
    let conn_b = mux_b.new_rendezvous(mux_a.local_addr()).expect("start b");

    let (result_a, result_b) = tokio::join!(conn_a.wait_connected(), conn_b.wait_connected());
    result_a.expect("a connected");
    result_b.expect("b connected");

    conn_a.write(b"hello from a").await.expect("a writes");
    let received = read_exact(&conn_b, 12).await;
    assert_eq!(&received, b"hello from a");

    conn_a.close().await.expect("close a");
    conn_b.close().await.expect("close b");
}

/// Forwards datagrams between a client and `server`, dropping the client's
///  data packets at `drop_indices` exactly once. Returns the relay address
///  and a counter of the client's data packets.
async fn lossy_relay(server: SocketAddr, drop_indices: Vec<usize>) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = tokio::net::UdpSocket::bind(localhost()).await.expect("bind relay");
    let addr = socket.local_addr().expect("relay addr");
    let counter = Arc::new(AtomicUsize::new(0));
    let data_packets = counter.clone();

    tokio::spawn(async move {
        let mut client: Option<SocketAddr> = None;
        let mut dropped: HashSet<usize> = HashSet::new();
        let mut buf = vec![0u8; 65_536];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else { return };
            let to = if from == server {
                match client {
                    Some(client) => client,
                    None => continue,
                }
            } else {
                if client.is_none() {
                    client = Some(from);
                }
                if client != Some(from) {
                    continue;
                }
                // high bit of the first word clear = a data packet
                if buf[0] & 0x80 == 0 {
                    let index = data_packets.fetch_add(1, Ordering::SeqCst);
                    if drop_indices.contains(&index) && dropped.insert(index) {
                        continue;
                    }
                }
                server
            };
            let _ = socket.send_to(&buf[..len], to).await;
        }
    });

    (addr, counter)
}

#[tokio::test(flavor = "multi_thread")]
async fn loss_is_recovered_in_order() {
    let (server_mux, mut accepted_rx) = listening_mux(stream_config()).await;
    let (relay_addr, data_packets) = lossy_relay(server_mux.local_addr(), vec![10, 11]).await;

    let client_mux = Multiplexer::bind(localhost(), stream_config()).await.expect("bind client");
    let client = client_mux.new_client(relay_addr).expect("start client");
    client.wait_connected().await.expect("client handshake through relay");
    let server = accepted_rx.recv().await.expect("accepted");

    const MESSAGES: usize = 100;
    const KIB: usize = 1024;
    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            for i in 0..MESSAGES {
                let chunk = vec![(i % 256) as u8; KIB];
                client.write(&chunk).await.expect("write");
            }
        })
    };

    let received = tokio::time::timeout(
        Duration::from_secs(30),
        read_exact(&server, MESSAGES * KIB),
    )
    .await
    .expect("transfer finished despite the drops");

    writer.await.expect("writer task");
    for (i, chunk) in received.chunks(KIB).enumerate() {
        assert!(chunk.iter().all(|&b| b == (i % 256) as u8), "chunk {} out of order", i);
    }

    // two drops cost a bounded number of retransmissions
    let sent = data_packets.load(Ordering::SeqCst);
    assert!(sent >= MESSAGES + 2, "every loss was retransmitted, sent {}", sent);
    assert!(sent <= MESSAGES + 20, "retransmissions stayed bounded, sent {}", sent);

    client.close().await.expect("close client");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_datagram_is_truncated() {
    let config = Config { datagram: true, ..Config::default() };
    let (client, server) = connected_pair(config).await;

    client.write(&vec![7u8; 2000]).await.expect("write datagram");
    client.write(b"second").await.expect("write follow-up");

    let mut buf = vec![0u8; 1000];
    let err = server.read(&mut buf).await.expect_err("undersized buffer");
    match err {
        rudt::Error::Truncated { copied } => assert_eq!(copied, 1000),
        other => panic!("expected truncation, got {:?}", other),
    }
    assert!(buf.iter().all(|&b| b == 7));

    // the remainder of the truncated datagram is discarded, not re-read
    let n = server.read(&mut buf).await.expect("next datagram");
    assert_eq!(&buf[..n], b"second");

    client.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn dialing_a_silent_peer_times_out() {
    // a bound socket that never answers
    let blackhole = tokio::net::UdpSocket::bind(localhost()).await.expect("bind blackhole");
    let blackhole_addr = blackhole.local_addr().expect("addr");

    let mux = Multiplexer::bind(localhost(), Config::default()).await.expect("bind");
    let conn = mux.new_client(blackhole_addr).expect("start client");

    let started = Instant::now();
    let err = conn.wait_connected().await.expect_err("nobody answers");
    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(conn.state(), SocketState::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "timed out after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "timed out after {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_delivers_everything_first() {
    let (client, server) = connected_pair(stream_config()).await;

    const TOTAL: usize = 10 * 1024;
    client.write(&vec![42u8; TOTAL]).await.expect("write 10 KiB");
    let close_started = Instant::now();
    client.close().await.expect("close");
    assert!(close_started.elapsed() < Duration::from_secs(6), "close respected the linger bound");

    let received = read_exact(&server, TOTAL).await;
    assert!(received.iter().all(|&b| b == 42));

    // with the stream drained, the peer's shutdown is now observable
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).await.expect_err("stream is over");
    assert!(matches!(err, rudt::Error::Closed), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn read_deadline_expires_and_clears() {
    let (client, server) = connected_pair(stream_config()).await;

    server.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).await.expect_err("no data before the deadline");
    assert!(err.is_timeout());

    // an expired deadline keeps failing reads until moved or cleared
    let err = server.read(&mut buf).await.expect_err("deadline still armed");
    assert!(err.is_timeout());

    server.set_read_deadline(None);
    client.write(b"late").await.expect("write");
    let n = server.read(&mut buf).await.expect("deadline cleared");
    assert_eq!(&buf[..n], b"late");

    client.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn close_unblocks_a_pending_read() {
    let (client, server) = connected_pair(stream_config()).await;

    let reader = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            server.read(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close().await.expect("close");
    let result = tokio::time::timeout(Duration::from_secs(6), reader)
        .await
        .expect("blocked read unblocked within linger + 1s")
        .expect("reader task");
    assert!(result.is_err());
}
