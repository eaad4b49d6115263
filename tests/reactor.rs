//! Reactor handle semantics: task execution, scheduling, shutdown.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use netvice::{CrusherError, Reactor};

#[test]
fn call_runs_on_the_reactor_thread_and_returns() {
    let reactor = Reactor::new().unwrap();
    let name = reactor
        .handle()
        .call(|_core| std::thread::current().name().map(str::to_owned))
        .unwrap();
    assert_eq!(name.as_deref(), Some("netvice-reactor"));
}

#[test]
fn execute_preserves_fifo_order() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (tx, rx) = mpsc::channel();

    for i in 0..32 {
        let tx = tx.clone();
        handle.execute(move |_core| tx.send(i).unwrap()).unwrap();
    }

    for i in 0..32 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
    }
}

#[test]
fn schedule_fires_after_the_delay() {
    let reactor = Reactor::new().unwrap();
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    reactor
        .handle()
        .schedule(Duration::from_millis(100), move |_core| {
            tx.send(()).unwrap();
        });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn cancelled_schedule_never_fires() {
    let reactor = Reactor::new().unwrap();
    let (tx, rx) = mpsc::channel::<()>();

    let schedule = reactor
        .handle()
        .schedule(Duration::from_millis(150), move |_core| {
            tx.send(()).unwrap();
        });
    schedule.cancel();
    schedule.cancel(); // idempotent

    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn closed_reactor_rejects_work() {
    let mut reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    reactor.close();
    reactor.close(); // idempotent

    assert!(matches!(
        handle.execute(|_core| {}),
        Err(CrusherError::ReactorGone)
    ));
    assert!(matches!(
        handle.call(|_core| 1),
        Err(CrusherError::ReactorGone)
    ));
}

#[test]
fn one_reactor_serves_many_crushers() {
    let reactor = Reactor::new().unwrap();
    let mut crushers = Vec::new();
    for _ in 0..4 {
        crushers.push(
            netvice::TcpCrusherBuilder::new()
                .with_local_address("127.0.0.1:0".parse().unwrap())
                .with_remote_address("127.0.0.1:1".parse().unwrap())
                .with_reactor(&reactor)
                .build_and_open()
                .unwrap(),
        );
    }
    for crusher in &crushers {
        assert!(crusher.is_open());
    }
    for crusher in &crushers {
        crusher.close().unwrap();
    }
}
