//! Overlay formation and routing convergence over in-process links.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mycel_core::{PackageFlags, PeerId};
use mycel_net::dispatcher::HookAction;
use mycel_net::iface::mem::MemRegistry;

use common::{dial, node, run, run_until, test_config};

const DT: Duration = Duration::from_millis(100);

#[test]
fn two_peers_learn_each_other() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);

    dial(&mut beta, "alpha", 8000);

    let converged = run_until(
        &mut [&mut alpha, &mut beta],
        DT,
        Duration::from_secs(10),
        |kernels| {
            kernels[0].core().router.route_for(&PeerId(20)).is_some()
                && kernels[1].core().router.route_for(&PeerId(10)).is_some()
        },
    );
    assert!(converged, "routes should appear in both directions");

    // Own entry: zero hops, no next hop connection.
    let own = alpha.core().router.entry(&PeerId(10)).expect("self entry");
    assert_eq!(own.hops, 0);
    assert!(own.conn.is_none());

    // Loopback peers cost one hop.
    let peer = alpha.core().router.entry(&PeerId(20)).expect("peer entry");
    assert_eq!(peer.hops, 1);
    assert!(peer.conn.is_some());
}

#[test]
fn directed_messages_arrive_exactly_once() {
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

    alpha
        .core_mut()
        .send_message(PeerId(20), 42, b"unicast payload".to_vec(), PackageFlags::default())
        .expect("send with route");

    run(&mut [&mut alpha, &mut beta], 20, DT);

    let received = received.lock().expect("lock");
    assert_eq!(received.as_slice(), &[b"unicast payload".to_vec()]);
}

#[test]
fn line_of_three_converges_and_reports_the_dead_end() {
    let registry = MemRegistry::new();
    let mut left = node(test_config(10, "left"), &registry, 8000);
    let mut middle = node(test_config(20, "middle"), &registry, 8000);
    let mut right = node(test_config(30, "right"), &registry, 8000);

    dial(&mut left, "middle", 8000);
    dial(&mut right, "middle", 8000);

    let deaths = Arc::new(Mutex::new(Vec::new()));
    {
        let deaths = deaths.clone();
        left.core_mut().on_dead_host(Box::new(move |peer, reason| {
            deaths.lock().expect("lock").push((peer, reason));
        }));
    }

    let converged = run_until(
        &mut [&mut left, &mut middle, &mut right],
        DT,
        Duration::from_secs(20),
        |kernels| kernels[0].core().router.route_for(&PeerId(30)).is_some(),
    );
    assert!(converged, "left should route to right through the middle");

    // Two loopback links of cost one each.
    let far = left.core().router.entry(&PeerId(30)).expect("far entry");
    assert_eq!(far.hops, 2);

    // Sever middle-right; the route must age out (or a death notice
    // arrive) and the dead-host callback fire exactly once on the left.
    let victims = middle.core().connections_to(PeerId(30));
    assert!(!victims.is_empty());
    for id in victims {
        middle.core_mut().close_connection(id, "test partition");
    }

    // The countdown spans four routing periods from band entry; allow one
    // more period for the loss to reach the left plus step granularity.
    let period = Duration::from_secs_f64(left.core().config.route_broadcast_period);
    let bound = period * 5 + Duration::from_millis(500);
    let declared = run_until(
        &mut [&mut left, &mut middle, &mut right],
        DT,
        bound,
        |kernels| kernels[0].core().router.entry(&PeerId(30)).is_none(),
    );
    assert!(declared, "route must be gone within four periods of the countdown");

    let deaths = deaths.lock().expect("lock");
    let about_right: Vec<_> =
        deaths.iter().filter(|(peer, _)| *peer == PeerId(30)).collect();
    assert_eq!(about_right.len(), 1, "dead-host callback fires exactly once");
}

#[test]
fn trace_returns_the_ids_of_every_hop() {
    let registry = MemRegistry::new();
    let mut left = node(test_config(10, "left"), &registry, 8000);
    let mut middle = node(test_config(20, "middle"), &registry, 8000);
    let mut right = node(test_config(30, "right"), &registry, 8000);

    dial(&mut left, "middle", 8000);
    dial(&mut right, "middle", 8000);

    let replies = Arc::new(Mutex::new(Vec::new()));
    {
        let replies = replies.clone();
        left.register_hook(
            mycel_core::package::port::TRACE_REPLY,
            Box::new(move |package, _via, _core| {
                replies.lock().expect("lock").push(package.payload.clone());
                HookAction::Stop
            }),
        );
    }

    assert!(run_until(
        &mut [&mut left, &mut middle, &mut right],
        DT,
        Duration::from_secs(20),
        |kernels| kernels[0].core().router.route_for(&PeerId(30)).is_some(),
    ));

    left.core_mut()
        .send_message(
            PeerId(30),
            mycel_core::package::port::TRACE,
            Vec::new(),
            mycel_core::PackageFlags::default(),
        )
        .expect("trace");
    run(&mut [&mut left, &mut middle, &mut right], 30, DT);

    let replies = replies.lock().expect("lock");
    assert_eq!(replies.len(), 1);
    // Every hop appended its id: the relay, then the destination.
    let hops: Vec<i32> = replies[0]
        .chunks(4)
        .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    assert_eq!(hops, vec![20, 30]);
}

#[test]
fn broadcast_in_a_cycle_is_delivered_once_per_peer() {
    let registry = MemRegistry::new();
    let mut a = node(test_config(10, "a"), &registry, 8000);
    let mut b = node(test_config(20, "b"), &registry, 8000);
    let mut c = node(test_config(30, "c"), &registry, 8000);

    // Triangle: every pair linked, so the flood has a loop to run in.
    dial(&mut a, "b", 8000);
    dial(&mut b, "c", 8000);
    dial(&mut c, "a", 8000);

    let b_count = Arc::new(AtomicU32::new(0));
    let c_count = Arc::new(AtomicU32::new(0));
    for (kernel, counter) in [(&mut b, &b_count), (&mut c, &c_count)] {
        let counter = (*counter).clone();
        kernel.register_hook(
            50,
            Box::new(move |_package, _via, _core| {
                counter.fetch_add(1, Ordering::Relaxed);
                HookAction::Stop
            }),
        );
    }

    assert!(run_until(
        &mut [&mut a, &mut b, &mut c],
        DT,
        Duration::from_secs(10),
        |kernels| {
            kernels.iter().all(|kernel| kernel.core().established_count() >= 2)
        },
    ));

    a.core_mut()
        .broadcast(50, b"flood".to_vec(), PackageFlags::default())
        .expect("broadcast");
    run(&mut [&mut a, &mut b, &mut c], 30, DT);

    assert_eq!(b_count.load(Ordering::Relaxed), 1, "b hears the flood once");
    assert_eq!(c_count.load(Ordering::Relaxed), 1, "c hears the flood once");
}
