//! Overlay daemon: brings up a kernel with TCP/UDP drivers and multicast
//! discovery, seeds configured tuples, then steps the kernel until told
//! to stop. Shutdown is cooperative: the signal only flips a flag that
//! the step loop observes.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use mycel_core::{LinkUrl, NetworkName};
use mycel_net::iface::beacon;
use mycel_net::iface::tcp::TcpDriver;
use mycel_net::iface::udp::UdpDriver;
use mycel_net::{Kernel, NetConfig};
use mycel_tuples::{Tuple, TupleService};

const DEFAULT_STREAM_PORT: u16 = 8000;

#[derive(Parser, Debug)]
#[command(name = "myceld", about = "mycel overlay daemon", version)]
struct Cli {
    /// TOML configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fixed peer id instead of a random one.
    #[arg(long)]
    id: Option<i32>,

    /// Stream listen port (next free one upward is taken when busy).
    #[arg(long)]
    port: Option<u16>,

    /// Rendezvous URL, e.g. tcp://hub.local:8000; repeatable.
    #[arg(long)]
    connect: Vec<String>,

    /// Overlay network string.
    #[arg(long)]
    network: Option<String>,

    /// Seed a tuple at startup as key=value; repeatable.
    #[arg(long = "set-tuple")]
    set_tuple: Vec<String>,

    /// Act as the authoritative clock source.
    #[arg(long)]
    time_master: bool,

    /// Artificial inbound drop probability, for loss testing.
    #[arg(long)]
    package_loss: Option<f64>,

    /// Refuse non-loopback links.
    #[arg(long)]
    leaf: bool,

    /// Link cost metric (1..16).
    #[arg(long)]
    net_metric: Option<u8>,
}

fn load_config(cli: &Cli) -> NetConfig {
    let mut config = match &cli.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(err) => {
                    log::error!("config {path:?} is invalid: {err}");
                    std::process::exit(2);
                }
            },
            Err(err) => {
                log::error!("config {path:?} unreadable: {err}");
                std::process::exit(2);
            }
        },
        None => NetConfig::default(),
    };

    if let Some(id) = cli.id {
        config.id = Some(id);
    }
    if let Some(network) = &cli.network {
        config.network = NetworkName::new(network);
    }
    if cli.time_master {
        config.time_master = true;
    }
    if let Some(loss) = cli.package_loss {
        config.package_loss = loss.clamp(0.0, 1.0);
    }
    if cli.leaf {
        config.leaf = true;
    }
    if let Some(metric) = cli.net_metric {
        config.metric_cost = metric.clamp(1, 16);
    }
    if config.hostname.is_empty() {
        config.hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "mycel-host".to_string());
    }
    config
}

fn seed_tuples(kernel: &mut Kernel, tuples: &TupleService, seeds: &[String]) {
    for seed in seeds {
        let Some((key, value)) = seed.split_once('=') else {
            log::warn!("--set-tuple wants key=value, got '{seed}'");
            continue;
        };
        let own_id = kernel.core().own_id;
        let tuple = Tuple::new(own_id, key, value.as_bytes().to_vec());
        match tuples.set(kernel.core_mut(), tuple) {
            Ok(written) => log::info!("seeded tuple {written}"),
            Err(err) => log::warn!("seeding '{key}' failed: {err}"),
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli);
    let multicast_group: Ipv4Addr = config
        .multicast_group
        .parse()
        .unwrap_or(Ipv4Addr::new(227, 1, 3, 5));
    let multicast_port = config.multicast_port;

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("runtime startup failed: {err}");
            std::process::exit(1);
        }
    };
    let handle = runtime.handle().clone();

    let mut kernel = Kernel::new(config);
    let tuples = TupleService::attach(&mut kernel);

    {
        let core = kernel.core_mut();
        let tcp = core.add_driver(Box::new(TcpDriver::new(handle.clone())));
        core.add_driver(Box::new(UdpDriver::new(handle.clone())));

        let want_port = cli.port.unwrap_or(DEFAULT_STREAM_PORT);
        match core.listen_on(tcp, want_port) {
            Ok(bound) => log::info!("accepting stream links on {bound}"),
            Err(err) => {
                log::error!("cannot listen on {want_port}: {err}");
                std::process::exit(1);
            }
        }

        match beacon::spawn_multicast(&handle, multicast_group, multicast_port) {
            Ok(channel) => core.set_beacon(channel),
            Err(err) => log::warn!("discovery beacons unavailable: {err}"),
        }

        for url in &cli.connect {
            match url.parse::<LinkUrl>() {
                Ok(url) => {
                    if let Err(err) = core.connect_url(&url) {
                        log::warn!("connect to {url} failed to start: {err}");
                    }
                }
                Err(err) => log::error!("bad --connect URL '{url}': {err}"),
            }
        }
    }

    seed_tuples(&mut kernel, &tuples, &cli.set_tuple);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, shutting down");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    log::info!("peer {} up", kernel.core().own_id);
    runtime.block_on(async {
        loop {
            if stop.load(Ordering::Relaxed) {
                kernel.shutdown();
                break;
            }
            kernel.step();
            tokio::time::sleep(kernel.idle_budget()).await;
        }
    });
}
