//! Link greeting validation: the overlay refuses peers that do not
//! belong, before any routing state is built.

mod common;

use std::time::Duration;

use mycel_core::NetworkName;
use mycel_net::iface::mem::MemRegistry;

use common::{dial, node, run, test_config};

const DT: Duration = Duration::from_millis(100);

#[test]
fn id_collision_never_establishes() {
    let registry = MemRegistry::new();
    // Two components both claiming id 10.
    let mut first = node(test_config(10, "first"), &registry, 8000);
    let mut second = node(test_config(10, "second"), &registry, 8000);

    dial(&mut second, "first", 8000);
    run(&mut [&mut first, &mut second], 100, DT);

    assert_eq!(first.core().established_count(), 0);
    assert_eq!(second.core().established_count(), 0);
    assert!(first.core().router.route_for(&mycel_core::PeerId(10)).is_none());
}

#[test]
fn wrong_network_string_is_refused() {
    let registry = MemRegistry::new();
    let mut ours = node(test_config(10, "ours"), &registry, 8000);

    let mut other_config = test_config(20, "theirs");
    other_config.network = NetworkName::new("somewhere-else");
    let mut theirs = node(other_config, &registry, 8000);

    dial(&mut theirs, "ours", 8000);
    run(&mut [&mut ours, &mut theirs], 100, DT);

    assert_eq!(ours.core().established_count(), 0);
    assert_eq!(theirs.core().established_count(), 0);
}

#[test]
fn matching_greetings_establish_both_ways() {
    let registry = MemRegistry::new();
    let mut alpha = node(test_config(10, "alpha"), &registry, 8000);
    let mut beta = node(test_config(20, "beta"), &registry, 8000);

    dial(&mut beta, "alpha", 8000);
    run(&mut [&mut alpha, &mut beta], 30, DT);

    assert_eq!(alpha.core().established_count(), 1);
    assert_eq!(beta.core().established_count(), 1);
}
