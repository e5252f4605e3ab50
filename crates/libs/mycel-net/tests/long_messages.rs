//! Long messages: transparent fragmentation, byte-identical reassembly
//! and aggregated acknowledgement over every fragment.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mycel_core::package::MAX_PAYLOAD;
use mycel_core::PeerId;
use mycel_net::dispatcher::HookAction;
use mycel_net::iface::mem::MemRegistry;
use mycel_net::DeliveryStatus;

use common::{dial, node, run, run_until, test_config};

const DT: Duration = Duration::from_millis(100);

fn payload_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn twelve_kib_arrives_byte_identical_in_one_delivery() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);
    dial(&mut beta, "alpha", 8000);

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        beta.register_hook(
            42,
            Box::new(move |package, _via, _core| {
                received.lock().expect("lock").push(package.payload.clone());
                HookAction::Stop
            }),
        );
    }

    assert!(run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |kernels| kernels[0].core().router.route_for(&PeerId(20)).is_some(),
    ));

    let payload = payload_of(12 * 1024);
    assert_eq!(payload.len() % MAX_PAYLOAD, 0, "twelve full fragments");

    let acked = Arc::new(Mutex::new(Vec::new()));
    {
        let acked = acked.clone();
        alpha
            .core_mut()
            .send_reliable(
                PeerId(20),
                42,
                payload.clone(),
                Some(Box::new(move |status| {
                    acked.lock().expect("lock").push(status);
                })),
            )
            .expect("send long message");
    }

    let delivered = run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(20),
        |_| !received.lock().expect("lock").is_empty(),
    );
    assert!(delivered);

    let received = received.lock().expect("lock");
    assert_eq!(received.len(), 1, "the hook runs once, on the whole message");
    assert_eq!(received[0].len(), 12 * 1024);
    assert_eq!(received[0], payload);

    // The aggregate callback resolves only after every fragment acked.
    let mut settled = false;
    for _ in 0..100 {
        if !acked.lock().expect("lock").is_empty() {
            settled = true;
            break;
        }
        alpha.core_mut().clock.advance(DT);
        alpha.step();
        beta.core_mut().clock.advance(DT);
        beta.step();
    }
    assert!(settled);
    assert_eq!(acked.lock().expect("lock").as_slice(), &[DeliveryStatus::Acked]);
}

#[test]
fn total_loss_fails_the_whole_message_and_invokes_no_hook() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);
    dial(&mut beta, "alpha", 8000);

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        beta.register_hook(
            42,
            Box::new(move |package, _via, _core| {
                received.lock().expect("lock").push(package.payload.clone());
                HookAction::Stop
            }),
        );
    }

    assert!(run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |kernels| kernels[0].core().router.route_for(&PeerId(20)).is_some(),
    ));

    // Every inbound package at beta is now lost.
    beta.core_mut().config.package_loss = 1.0;

    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = failures.clone();
        alpha
            .core_mut()
            .send_reliable(
                PeerId(20),
                42,
                payload_of(3 * MAX_PAYLOAD + 17),
                Some(Box::new(move |status| {
                    failures.lock().expect("lock").push(status);
                })),
            )
            .expect("send long message");
    }

    run(&mut [&mut alpha, &mut beta], 150, DT);

    assert!(received.lock().expect("lock").is_empty(), "no partial delivery");
    let failures = failures.lock().expect("lock");
    assert_eq!(failures.len(), 1, "the aggregate fails exactly once");
    assert_eq!(failures[0], DeliveryStatus::RetriesExhausted);
}

#[test]
fn oversized_message_is_refused_by_the_admission_check() {
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

    // More fragments than the queue could plausibly absorb.
    let huge = payload_of(60 * MAX_PAYLOAD);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let result = {
        let failures = failures.clone();
        alpha.core_mut().send_reliable(
            PeerId(20),
            42,
            huge,
            Some(Box::new(move |status| {
                failures.lock().expect("lock").push(status);
            })),
        )
    };

    assert!(result.is_err());
    assert_eq!(failures.lock().expect("lock").as_slice(), &[DeliveryStatus::RedDrop]);
}
