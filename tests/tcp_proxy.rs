//! End-to-end TCP proxy scenarios over real localhost sockets.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use netvice::{CrusherError, Reactor, TcpCrusherBuilder};

const WAIT: Duration = Duration::from_secs(5);

static INIT_LOGS: Once = Once::new();

fn init_logs() {
    INIT_LOGS.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

/// Echoes every connection until EOF. The thread serves for the rest of
/// the test process.
fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Accepts connections and accumulates everything received.
fn spawn_sink_server() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().unwrap().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });
    (addr, received)
}

fn proxy_to(reactor: &Reactor, remote: SocketAddr) -> netvice::TcpCrusher {
    TcpCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address(remote)
        .with_reactor(reactor)
        .build_and_open()
        .unwrap()
}

#[test]
fn echo_roundtrip_with_half_close() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"Hello").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"Hello");

    // The pair reaches CLOSED once both directions finish.
    wait_until("pair teardown", || crusher.pairs().unwrap().is_empty());
}

#[test]
fn freeze_holds_bytes_until_unfreeze() {
    init_logs();
    let (remote, received) = spawn_sink_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
    client.write_all(b"warmup").unwrap();
    wait_until("warmup delivery", || received.lock().unwrap().len() == 6);

    crusher.freeze().unwrap();
    assert!(crusher.is_frozen().unwrap());
    crusher.freeze().unwrap(); // idempotent

    client.write_all(b"frozen payload").unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(received.lock().unwrap().len(), 6, "bytes leaked while frozen");

    crusher.unfreeze().unwrap();
    assert!(!crusher.is_frozen().unwrap());
    crusher.unfreeze().unwrap(); // idempotent

    let mut expected = b"warmup".to_vec();
    expected.extend_from_slice(b"frozen payload");
    wait_until("buffered delivery", || {
        *received.lock().unwrap() == expected
    });
}

#[test]
fn crush_severs_live_pairs_and_accepts_again() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
        client.set_read_timeout(Some(WAIT)).unwrap();
        client.write_all(&[i; 4]).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [i; 4]);
        clients.push(client);
    }
    assert_eq!(crusher.pairs().unwrap().len(), 3);

    crusher.crush().unwrap();

    for client in &mut clients {
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("crushed pair delivered {n} bytes"),
        }
    }

    // The listening socket is back on the same port.
    let mut fresh = TcpStream::connect(crusher.local_addr()).unwrap();
    fresh.set_read_timeout(Some(WAIT)).unwrap();
    fresh.write_all(b"again").unwrap();
    let mut buf = [0u8; 5];
    fresh.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"again");
}

#[test]
fn connect_timeout_closes_accepted_socket() {
    init_logs();
    let reactor = Reactor::new().unwrap();
    // TEST-NET-3: blackholed, the connect can never complete.
    let crusher = TcpCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address("203.0.113.1:1".parse().unwrap())
        .with_reactor(&reactor)
        .with_connection_timeout(Duration::from_millis(200))
        .build_and_open()
        .unwrap();

    let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes through a dead remote"),
    }
    assert!(crusher.pairs().unwrap().is_empty(), "no pair may be published");
}

#[test]
fn single_byte_buffers_still_relay() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = TcpCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address(remote)
        .with_reactor(&reactor)
        .with_buffer_count(1)
        .with_buffer_size(1)
        .build_and_open()
        .unwrap();

    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

    let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(&payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, payload, "byte-at-a-time pipelining corrupted data");
}

#[test]
fn pair_snapshot_reports_addresses_and_bytes() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let mut client = TcpStream::connect(crusher.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"count me").unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).unwrap();

    let pairs = crusher.pairs().unwrap();
    assert_eq!(pairs.len(), 1);
    let info = &pairs[0];
    assert_eq!(info.client_addr, client.local_addr().unwrap());
    assert_eq!(info.listen_addr, crusher.local_addr());
    assert_eq!(info.outer_remote_addr, remote);
    assert_eq!(info.bytes_inner_to_outer, 8);
    assert_eq!(info.bytes_outer_to_inner, 8);

    crusher.close_pair(info.client_addr).unwrap();
    wait_until("pair close by key", || crusher.pairs().unwrap().is_empty());
}

#[test]
fn listeners_fire_once_per_pair() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();

    let (created_tx, created_rx) = mpsc::channel();
    let (deleted_tx, deleted_rx) = mpsc::channel();
    let crusher = TcpCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address(remote)
        .with_reactor(&reactor)
        .with_creation_listener(move |info| created_tx.send(info.client_addr).unwrap())
        .with_deletion_listener(move |info| deleted_tx.send(info.client_addr).unwrap())
        .build_and_open()
        .unwrap();

    let client = TcpStream::connect(crusher.local_addr()).unwrap();
    let client_addr = client.local_addr().unwrap();

    assert_eq!(created_rx.recv_timeout(WAIT).unwrap(), client_addr);
    drop(client);
    assert_eq!(deleted_rx.recv_timeout(WAIT).unwrap(), client_addr);

    // Exactly once each.
    assert!(created_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(deleted_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn builder_rejects_incomplete_configuration() {
    let reactor = Reactor::new().unwrap();

    assert!(matches!(
        TcpCrusherBuilder::new().build(),
        Err(CrusherError::Config(_))
    ));
    assert!(matches!(
        TcpCrusherBuilder::new()
            .with_local_address("127.0.0.1:0".parse().unwrap())
            .build(),
        Err(CrusherError::Config(_))
    ));
    assert!(matches!(
        TcpCrusherBuilder::new()
            .with_local_address("127.0.0.1:0".parse().unwrap())
            .with_remote_address("127.0.0.1:1".parse().unwrap())
            .build(),
        Err(CrusherError::Config(_))
    ));

    let crusher = TcpCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address("127.0.0.1:1".parse().unwrap())
        .with_reactor(&reactor)
        .build()
        .unwrap();
    assert!(!crusher.is_open());
}

#[test]
fn lifecycle_state_errors() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    assert!(crusher.is_open());
    assert!(matches!(crusher.open(), Err(CrusherError::State(_))));

    crusher.close().unwrap();
    assert!(!crusher.is_open());
    crusher.close().unwrap(); // close on closed is a no-op

    assert!(matches!(crusher.unfreeze(), Err(CrusherError::State(_))));
    assert!(matches!(crusher.is_frozen(), Err(CrusherError::State(_))));
    assert!(matches!(crusher.crush(), Err(CrusherError::State(_))));
    crusher.freeze().unwrap(); // freeze on closed is a logged no-op

    // open-close-open behaves like a fresh open
    crusher.open().unwrap();
    assert!(crusher.is_open());
    assert!(!crusher.is_frozen().unwrap());
}

#[test]
fn relays_many_interleaved_connections() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);
    let local = crusher.local_addr();

    let workers: Vec<_> = (0..8u8)
        .map(|seed| {
            thread::spawn(move || {
                let payload: Vec<u8> = (0..4096u32).map(|i| (i as u8).wrapping_add(seed)).collect();
                let mut client = TcpStream::connect(local).unwrap();
                client.set_read_timeout(Some(WAIT)).unwrap();
                client.write_all(&payload).unwrap();
                client.shutdown(Shutdown::Write).unwrap();
                let mut echoed = Vec::new();
                client.read_to_end(&mut echoed).unwrap();
                assert_eq!(echoed, payload);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    wait_until("all pairs closed", || crusher.pairs().unwrap().is_empty());
}

#[test]
fn crush_key_distinctness() {
    // Pairs are keyed by client address; two live clients must never
    // collide.
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let mut a = TcpStream::connect(crusher.local_addr()).unwrap();
    let mut b = TcpStream::connect(crusher.local_addr()).unwrap();
    for client in [&mut a, &mut b] {
        client.set_read_timeout(Some(WAIT)).unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
    }

    let keys: HashSet<_> = crusher
        .pairs()
        .unwrap()
        .into_iter()
        .map(|info| info.client_addr)
        .collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&a.local_addr().unwrap()));
    assert!(keys.contains(&b.local_addr().unwrap()));
}

#[test]
fn read_errors_are_contained_to_one_pair() {
    init_logs();
    let remote = spawn_echo_server();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    // A pair that dies abruptly must not disturb its neighbor.
    let mut rude = TcpStream::connect(crusher.local_addr()).unwrap();
    let mut polite = TcpStream::connect(crusher.local_addr()).unwrap();
    polite.set_read_timeout(Some(WAIT)).unwrap();
    polite.write_all(b"before").unwrap();
    let mut buf = [0u8; 6];
    polite.read_exact(&mut buf).unwrap();

    // Leave the echo reply unread in rude's receive buffer; closing a
    // socket with unread data makes the kernel send RST.
    rude.write_all(b"x").unwrap();
    wait_until("rude echo relayed", || {
        crusher
            .pairs()
            .unwrap()
            .iter()
            .any(|info| info.bytes_outer_to_inner == 1)
    });
    drop(rude);

    wait_until("rude pair removed", || crusher.pairs().unwrap().len() == 1);

    polite.write_all(b"after!").unwrap();
    polite.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"after!");
}
