//! Reliable delivery: acknowledgement bundles settle sends, and a silent
//! peer costs exactly one failure callback after the retry budget.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mycel_core::PeerId;
use mycel_net::iface::mem::MemRegistry;
use mycel_net::DeliveryStatus;

use common::{dial, node, run, run_until, test_config};

const DT: Duration = Duration::from_millis(100);

fn status_recorder() -> (Arc<Mutex<Vec<DeliveryStatus>>>, mycel_net::AckFn) {
    let seen: Arc<Mutex<Vec<DeliveryStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: mycel_net::AckFn = Box::new(move |status| {
        sink.lock().expect("lock").push(status);
    });
    (seen, callback)
}

#[test]
fn acked_send_resolves_successfully() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);
    dial(&mut beta, "alpha", 8000);

    assert!(run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |kernels| kernels[0].core().router.route_for(&PeerId(20)).is_some(),
    ));

    let (seen, callback) = status_recorder();
    alpha
        .core_mut()
        .send_reliable(PeerId(20), 42, b"important".to_vec(), Some(callback))
        .expect("send");

    let resolved = run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |_| !seen.lock().expect("lock").is_empty(),
    );
    assert!(resolved);
    assert_eq!(seen.lock().expect("lock").as_slice(), &[DeliveryStatus::Acked]);
}

#[test]
fn silent_peer_fails_once_after_the_retry_budget() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);
    dial(&mut beta, "alpha", 8000);

    assert!(run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |kernels| kernels[0].core().router.route_for(&PeerId(20)).is_some(),
    ));

    let (seen, callback) = status_recorder();
    let deadline = alpha.core().config.reliable_deadline();
    let sent_at = alpha.core().clock.now();
    alpha
        .core_mut()
        .send_reliable(PeerId(20), 42, b"into the void".to_vec(), Some(callback))
        .expect("send");

    // Beta goes silent: it is never stepped again, so nothing acks.
    // Just short of the deterministic budget nothing may fire yet.
    let almost = (deadline.as_secs_f64() / DT.as_secs_f64()) as usize - 2;
    run(&mut [&mut alpha], almost, DT);
    assert!(seen.lock().expect("lock").is_empty(), "no failure before the budget");

    run(&mut [&mut alpha], 70, DT);
    let seen = seen.lock().expect("lock");
    assert_eq!(seen.as_slice(), &[DeliveryStatus::RetriesExhausted]);

    let elapsed = alpha.core().clock.now() - sent_at;
    assert!(elapsed >= deadline.as_micros() as i64);
}

#[test]
fn send_without_a_route_fails_immediately() {
    let registry = MemRegistry::new();
    let mut lonely = node(test_config(10, "lonely"), &registry, 8000);

    let (seen, callback) = status_recorder();
    let result =
        lonely.core_mut().send_reliable(PeerId(99), 42, b"anyone?".to_vec(), Some(callback));

    assert!(result.is_err());
    assert_eq!(seen.lock().expect("lock").as_slice(), &[DeliveryStatus::NoRoute]);
}
