//! Test overlay plumbing: kernels over in-process links with manual
//! clocks, so whole topologies run deterministically without sockets.

#![allow(dead_code)]

use std::time::Duration;

use mycel_core::{Clock, Timestamp};
use mycel_net::iface::mem::{MemDriver, MemRegistry};
use mycel_net::{Kernel, NetConfig};

pub fn test_config(id: i32, hostname: &str) -> NetConfig {
    let mut config = NetConfig::default();
    config.id = Some(id);
    config.hostname = hostname.to_string();
    config.fullname = format!("{hostname}.test");
    // Tight periods keep the simulated runs short.
    config.route_broadcast_period = 0.5;
    config.connmgr_period = 0.5;
    config.beacon_period = 0.5;
    config.hostinfo_period = 1.0;
    config.cluster_check_period = 1.0;
    config
}

/// A kernel listening on an in-process endpoint `hostname:port`.
pub fn node(config: NetConfig, registry: &MemRegistry, port: u16) -> Kernel {
    let hostname = config.hostname.clone();
    let start = Timestamp::from_parts(1_000_000, 0);
    let mut kernel = Kernel::with_clock(config, Clock::manual(start));

    let core = kernel.core_mut();
    let driver = MemDriver::new(registry.clone(), &hostname);
    let index = core.add_driver(Box::new(driver));
    core.listen_on(index, port).expect("listen on test endpoint");
    kernel
}

pub fn dial(kernel: &mut Kernel, hostname: &str, port: u16) {
    let url = format!("tcp://{hostname}:{port}").parse().expect("test url");
    kernel.core_mut().connect_url(&url).expect("dial test endpoint");
}

/// Steps every kernel `steps` times, advancing each manual clock by `dt`
/// between rounds.
pub fn run(kernels: &mut [&mut Kernel], steps: usize, dt: Duration) {
    for _ in 0..steps {
        for kernel in kernels.iter_mut() {
            kernel.core_mut().clock.advance(dt);
            kernel.step();
        }
    }
}

/// Runs until `predicate` holds or the simulated budget is exhausted.
pub fn run_until(
    kernels: &mut [&mut Kernel],
    dt: Duration,
    budget: Duration,
    mut predicate: impl FnMut(&[&mut Kernel]) -> bool,
) -> bool {
    let steps = (budget.as_secs_f64() / dt.as_secs_f64()).ceil() as usize;
    for _ in 0..steps {
        if predicate(kernels) {
            return true;
        }
        for kernel in kernels.iter_mut() {
            kernel.core_mut().clock.advance(dt);
            kernel.step();
        }
    }
    predicate(kernels)
}
