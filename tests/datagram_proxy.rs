//! End-to-end UDP proxy scenarios over real localhost sockets.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use netvice::{CrusherError, DatagramCrusherBuilder, Reactor};

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

/// Echoes every datagram back to its sender and records the sources it
/// saw. The thread serves for the rest of the test process.
fn spawn_udp_echo() -> (SocketAddr, Arc<Mutex<Vec<SocketAddr>>>) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = sock.local_addr().unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        loop {
            match sock.recv_from(&mut buf) {
                Ok((n, src)) => {
                    record.lock().unwrap().push(src);
                    let _ = sock.send_to(&buf[..n], src);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => break,
            }
        }
    });
    (addr, seen)
}

fn proxy_to(reactor: &Reactor, remote: SocketAddr) -> netvice::DatagramCrusher {
    DatagramCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address(remote)
        .with_reactor(reactor)
        .build_and_open()
        .unwrap()
}

fn client() -> UdpSocket {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(WAIT)).unwrap();
    sock
}

#[test]
fn fan_in_routes_replies_per_source() {
    init_logs();
    let (remote, seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let a = client();
    let b = client();
    a.send_to(&[1, 2, 3], crusher.local_addr()).unwrap();
    b.send_to(&[1, 2, 3], crusher.local_addr()).unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[1, 2, 3]);
    assert_eq!(from, crusher.local_addr());
    let (n, from) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[1, 2, 3]);
    assert_eq!(from, crusher.local_addr());

    // The remote saw two distinct outer sockets, neither of them the
    // clients themselves.
    let sources: HashSet<_> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(sources.len(), 2);
    assert!(!sources.contains(&a.local_addr().unwrap()));
    assert!(!sources.contains(&b.local_addr().unwrap()));

    assert_eq!(crusher.virtual_connections().unwrap(), 2);
}

#[test]
fn idle_outers_are_swept_on_new_source() {
    init_logs();
    let (remote, _seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = DatagramCrusherBuilder::new()
        .with_local_address("127.0.0.1:0".parse().unwrap())
        .with_remote_address(remote)
        .with_reactor(&reactor)
        .with_max_idle_duration(Duration::from_millis(100))
        .build_and_open()
        .unwrap();

    let a = client();
    a.send_to(&[9], crusher.local_addr()).unwrap();
    let mut buf = [0u8; 16];
    a.recv_from(&mut buf).unwrap();
    assert_eq!(crusher.virtual_connections().unwrap(), 1);

    thread::sleep(Duration::from_millis(250));

    // B's arrival triggers the sweep; A is long idle by now.
    let b = client();
    b.send_to(&[8], crusher.local_addr()).unwrap();
    b.recv_from(&mut buf).unwrap();
    assert_eq!(crusher.virtual_connections().unwrap(), 1);

    // A comes back and gets a fresh virtual connection.
    a.send_to(&[7], crusher.local_addr()).unwrap();
    a.recv_from(&mut buf).unwrap();
    assert_eq!(crusher.virtual_connections().unwrap(), 2);
}

#[test]
fn freeze_stops_packets_until_unfreeze() {
    init_logs();
    let (remote, seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    crusher.freeze().unwrap();
    assert!(crusher.is_frozen().unwrap());
    crusher.freeze().unwrap(); // idempotent

    let a = client();
    a.send_to(&[7, 7], crusher.local_addr()).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(seen.lock().unwrap().is_empty(), "packet leaked while frozen");

    crusher.unfreeze().unwrap();
    assert!(!crusher.is_frozen().unwrap());

    let mut buf = [0u8; 16];
    let (n, _) = a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[7, 7]);
}

#[test]
fn crush_destroys_virtual_connections_and_relays_again() {
    init_logs();
    let (remote, _seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);
    let proxy_addr = crusher.local_addr();

    let a = client();
    let mut buf = [0u8; 16];
    a.send_to(&[5], proxy_addr).unwrap();
    a.recv_from(&mut buf).unwrap();
    assert_eq!(crusher.virtual_connections().unwrap(), 1);

    crusher.crush().unwrap();
    assert_eq!(crusher.local_addr(), proxy_addr, "crush must keep the port");
    assert_eq!(crusher.virtual_connections().unwrap(), 0);

    a.send_to(&[6], proxy_addr).unwrap();
    let (n, _) = a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[6]);
    assert_eq!(crusher.virtual_connections().unwrap(), 1);
}

#[test]
fn builder_rejects_incomplete_configuration() {
    let reactor = Reactor::new().unwrap();

    assert!(matches!(
        DatagramCrusherBuilder::new().build(),
        Err(CrusherError::Config(_))
    ));
    assert!(matches!(
        DatagramCrusherBuilder::new()
            .with_local_address("127.0.0.1:0".parse().unwrap())
            .with_remote_address("127.0.0.1:1".parse().unwrap())
            .build(),
        Err(CrusherError::Config(_))
    ));

    let crusher = DatagramCrusherBuilder::new()
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
    let (remote, _seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    assert!(matches!(crusher.open(), Err(CrusherError::State(_))));

    crusher.close().unwrap();
    crusher.close().unwrap(); // close on closed is a no-op
    assert!(!crusher.is_open());
    assert!(matches!(crusher.unfreeze(), Err(CrusherError::State(_))));
    assert!(matches!(crusher.is_frozen(), Err(CrusherError::State(_))));
    assert!(matches!(crusher.crush(), Err(CrusherError::State(_))));
    assert!(matches!(
        crusher.virtual_connections(),
        Err(CrusherError::State(_))
    ));
    crusher.freeze().unwrap(); // freeze on closed is a logged no-op

    crusher.open().unwrap();
    assert!(crusher.is_open());
    assert!(!crusher.is_frozen().unwrap());
}

#[test]
fn empty_datagrams_pass_through() {
    init_logs();
    let (remote, seen) = spawn_udp_echo();
    let reactor = Reactor::new().unwrap();
    let crusher = proxy_to(&reactor, remote);

    let a = client();
    a.send_to(&[], crusher.local_addr()).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = a.recv_from(&mut buf).unwrap();
    assert_eq!(n, 0);
    assert_eq!(seen.lock().unwrap().len(), 1);
}
