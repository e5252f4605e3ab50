//! The middleware kernel. One owned structure holds every component;
//! exactly one logical thread drives it by calling [`Kernel::step`], which
//! accepts fresh links, pumps inbound frames through duplicate suppression
//! and the port hooks, drains the outgoing queues and runs due periodic
//! jobs. Nothing in here blocks: link I/O happens in driver tasks behind
//! non-blocking channels. [`ThreadedKernel`] wraps the step loop in a
//! dedicated worker thread for applications that prefer not to drive it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_core::{OsRng, RngCore};

use mycel_core::package::{port, MAX_PAYLOAD};
use mycel_core::{
    Clock, HostInfo, LinkUrl, Magic, Package, PackageFlags, PackageType, PeerId, Timestamp, Wire,
};

use crate::ackmgr::AckMgr;
use crate::config::NetConfig;
use crate::connection::{
    connect_flags, draw_package_id, ConnId, ConnState, Connection, Direction, Greeting,
    PROTOCOL_VERSION,
};
use crate::dispatcher::{Dispatcher, HookFn};
use crate::error::{DeadHostReason, DeliveryStatus, NetError};
use crate::iface::beacon::BeaconChannel;
use crate::iface::{DialState, FrameLink, LinkDriver, Listener, PendingDial};
use crate::loopstore::LoopStore;
use crate::periodic::{PeriodicFn, PeriodicScheduler};
use crate::queue::{red_survival, AckFn, PackagePool};
use crate::reassembly::Reassembly;
use crate::router::{RouteEvent, Router};

/// Hop ceiling for flooded packages; loops are already broken by the loop
/// store, this only bounds pathological graphs.
const BROADCAST_HOP_LIMIT: u8 = 15;

/// Frames taken from one link per step, so one busy neighbor cannot
/// starve the rest.
const FRAMES_PER_STEP: usize = 32;

/// Offset jumps below this just slide the clock; larger ones also rewrite
/// every timer so nothing fires spuriously.
const TIME_SHIFT_EPSILON_MICROS: i64 = 500_000;

pub type DeadHostFn = Box<dyn FnMut(PeerId, DeadHostReason) + Send>;

/// A configured rendezvous address, re-dialled while unconnected.
pub struct AutoHost {
    pub url: LinkUrl,
    pub conn: Option<ConnId>,
    pub last_attempt: Timestamp,
    pub dialing: bool,
}

struct DialAttempt {
    dial: PendingDial,
    started: Timestamp,
    autohost: Option<usize>,
}

pub(crate) struct Delivery {
    pub package: Package,
    pub via: Option<ConnId>,
}

struct LongSendState {
    remaining: usize,
    failed: bool,
    callback: Option<AckFn>,
}

pub struct KernelCore {
    pub config: NetConfig,
    pub clock: Clock,
    pub rng: SmallRng,
    pub own_id: PeerId,
    pub own_magic: Magic,
    pub cluster: PeerId,
    pub hosts: HashMap<PeerId, HostInfo>,
    /// Useful bytes exchanged with each peer since the last management
    /// pass; feeds the force-link rule.
    pub peer_traffic: HashMap<PeerId, u64>,
    pub router: Router,
    pub connections: HashMap<ConnId, Connection>,
    pub loopstore: LoopStore,
    pub pool: PackagePool,
    pub reassembly: Reassembly,
    pub ackmgr: AckMgr,
    pub autohosts: Vec<AutoHost>,
    pub beacon: Option<BeaconChannel>,
    pub shutdown: bool,

    drivers: Vec<Box<dyn LinkDriver>>,
    listeners: Vec<Listener>,
    dials: Vec<DialAttempt>,
    next_conn_id: u32,
    next_seq_id: u16,
    pub(crate) deliveries: VecDeque<Delivery>,
    pub(crate) deadhost_hooks: Vec<DeadHostFn>,
    pub(crate) pending_time_shift: i64,
}

impl KernelCore {
    pub fn new(config: NetConfig) -> Self {
        Self::with_clock(config, Clock::system())
    }

    pub fn with_clock(config: NetConfig, clock: Clock) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let mut rng = SmallRng::from_seed(seed);

        let own_id = match config.id {
            Some(id) if id >= 0 => PeerId(id),
            _ => PeerId(rng.gen_range(1..=i32::MAX)),
        };
        let own_magic = Magic(rng.gen());

        log::info!(
            "kernel: peer {} magic {} on network '{}'",
            own_id,
            own_magic,
            config.network
        );

        let loopstore = LoopStore::new(config.loop_ring_size, config.loop_hash_buckets);
        let pool = PackagePool::new(config.max_allocated_packages);
        let reassembly = Reassembly::new(
            config.max_assembly_buffers,
            Duration::from_secs_f64(config.long_message_timeout),
        );
        let ackmgr = AckMgr::new(config.max_acks_per_bundle);

        Self {
            config,
            clock,
            rng,
            own_id,
            own_magic,
            cluster: own_id,
            hosts: HashMap::new(),
            peer_traffic: HashMap::new(),
            router: Router::new(),
            connections: HashMap::new(),
            loopstore,
            pool,
            reassembly,
            ackmgr,
            autohosts: Vec::new(),
            beacon: None,
            shutdown: false,
            drivers: Vec::new(),
            listeners: Vec::new(),
            dials: Vec::new(),
            next_conn_id: 0,
            next_seq_id: 0,
            deliveries: VecDeque::new(),
            deadhost_hooks: Vec::new(),
            pending_time_shift: 0,
        }
    }

    pub fn add_driver(&mut self, driver: Box<dyn LinkDriver>) -> usize {
        self.drivers.push(driver);
        self.drivers.len() - 1
    }

    pub fn driver(&self, index: usize) -> Option<&dyn LinkDriver> {
        self.drivers.get(index).map(|driver| driver.as_ref())
    }

    pub fn drivers_iter(&self) -> impl Iterator<Item = &dyn LinkDriver> {
        self.drivers.iter().map(|driver| driver.as_ref())
    }

    /// Whether an attempt to `url` is already in flight.
    pub(crate) fn has_dial_to(&self, url: &LinkUrl) -> bool {
        self.dials.iter().any(|attempt| attempt.dial.url() == url)
    }

    /// Starts accepting on a driver; returns the actually bound port.
    pub fn listen_on(&mut self, driver: usize, want_port: u16) -> Result<u16, NetError> {
        let driver = self.drivers.get_mut(driver).ok_or(NetError::DriverFailure)?;
        let listener = driver.listen(want_port)?;
        let bound = listener.port();
        log::info!("kernel: listening on port {bound}");
        self.listeners.push(listener);
        Ok(bound)
    }

    pub fn set_beacon(&mut self, channel: BeaconChannel) {
        self.beacon = Some(channel);
    }

    /// Registers a rendezvous URL and starts dialling it.
    pub fn connect_url(&mut self, url: &LinkUrl) -> Result<(), NetError> {
        self.autohosts.push(AutoHost {
            url: url.clone(),
            conn: None,
            last_attempt: Timestamp::ZERO,
            dialing: false,
        });
        let index = self.autohosts.len() - 1;
        self.dial(url.clone(), Some(index))
    }

    pub fn on_dead_host(&mut self, hook: DeadHostFn) {
        self.deadhost_hooks.push(hook);
    }

    pub(crate) fn dial(&mut self, url: LinkUrl, autohost: Option<usize>) -> Result<(), NetError> {
        if self.config.leaf {
            return Err(NetError::DriverFailure);
        }

        let now = self.clock.now();
        let family = url.family();
        let driver = self
            .drivers
            .iter_mut()
            .find(|driver| driver.family() == family)
            .ok_or(NetError::DriverFailure)?;

        log::debug!("kernel: dialling {url}");
        let dial = driver.dial(&url)?;
        if let Some(index) = autohost {
            if let Some(autohost) = self.autohosts.get_mut(index) {
                autohost.dialing = true;
                autohost.last_attempt = now;
            }
        }
        self.dials.push(DialAttempt { dial, started: now, autohost });
        Ok(())
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.next_conn_id += 1;
        ConnId(self.next_conn_id)
    }

    /// Brings a fresh transport link under kernel control in the pending
    /// state and opens our side of the greeting.
    pub fn adopt_link(
        &mut self,
        link: FrameLink,
        direction: Direction,
        url: Option<LinkUrl>,
    ) -> ConnId {
        let now = self.clock.now();
        let id = self.next_conn_id();
        let cost = if link.is_loopback() { 1 } else { self.config.metric_cost };

        let mut conn =
            Connection::new(id, link, direction, url, cost, self.config.queue_capacity, now);

        let mut flags = 0u32;
        if self.config.leaf {
            flags |= connect_flags::FORCED_CL;
        }
        let greeting = Greeting::new(self.own_id, self.config.network.clone(), flags);
        if !conn.send_greeting(&greeting) {
            log::debug!("kernel: greeting refused on fresh link, dropping");
        }

        log::debug!("kernel: adopted link {id} ({direction:?})");
        self.connections.insert(id, conn);
        id
    }

    /// Connections to `peer` in any state.
    pub fn connections_to(&self, peer: PeerId) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.peer == Some(peer))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.connections.values().filter(|conn| conn.is_established()).count()
    }

    // ---- inbound ------------------------------------------------------

    pub(crate) fn accept_inbound(&mut self) {
        let leaf = self.config.leaf;
        let mut adopted = Vec::new();
        for listener in &mut self.listeners {
            while let Some(link) = listener.accept() {
                if leaf && !link.is_loopback() {
                    log::debug!("kernel: leaf mode refuses non-loopback link");
                    continue;
                }
                adopted.push(link);
            }
        }
        for link in adopted {
            let url = link.remote_url().cloned();
            self.adopt_link(link, Direction::Incoming, url);
        }
    }

    pub(crate) fn poll_dials(&mut self) {
        let now = self.clock.now();
        let connect_timeout = Duration::from_secs_f64(self.config.connect_timeout);

        let mut finished = Vec::new();
        for (index, attempt) in self.dials.iter_mut().enumerate() {
            let (state, link) = attempt.dial.poll();
            match state {
                DialState::Pending => {
                    if now - attempt.started > connect_timeout.as_micros() as i64 {
                        log::debug!("kernel: dial {} timed out", attempt.dial.url());
                        finished.push((index, None));
                    }
                }
                DialState::Established => finished.push((index, link)),
                DialState::Failed => {
                    log::debug!("kernel: dial {} failed", attempt.dial.url());
                    finished.push((index, None));
                }
            }
        }

        // Unwind from the back so indices stay valid.
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        for (index, link) in finished {
            let attempt = self.dials.remove(index);
            if let Some(autohost) = attempt.autohost {
                if let Some(autohost) = self.autohosts.get_mut(autohost) {
                    autohost.dialing = false;
                }
            }
            if let Some(link) = link {
                let url = attempt.dial.url().clone();
                let conn_id = self.adopt_link(link, Direction::Outgoing, Some(url));
                if let Some(autohost) = attempt.autohost {
                    if let Some(autohost) = self.autohosts.get_mut(autohost) {
                        autohost.conn = Some(conn_id);
                    }
                }
            }
        }
    }

    pub(crate) fn pump_inbound(&mut self) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else { continue };
            let (frames, alive) = conn.poll_frames(FRAMES_PER_STEP);
            for frame in frames {
                self.handle_frame(id, frame);
            }
            if !alive {
                self.close_connection(id, "transport pipe broken");
            }
        }
    }

    fn handle_frame(&mut self, via: ConnId, frame: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&via) else { return };

        if !conn.greeting_received {
            match Greeting::from_bytes(&frame) {
                Ok(greeting) => self.handle_greeting(via, greeting),
                Err(_) => self.close_connection(via, "malformed greeting"),
            }
            return;
        }

        match Package::from_bytes(&frame) {
            Ok(package) => self.handle_package(via, package, frame.len()),
            Err(err) => {
                log::debug!("kernel: bad frame on {via}: {err}");
                self.close_connection(via, "malformed package");
            }
        }
    }

    fn handle_greeting(&mut self, via: ConnId, greeting: Greeting) {
        let own_id = self.own_id;
        let network = self.config.network.clone();
        let now = self.clock.now();

        let reject = if greeting.version != PROTOCOL_VERSION {
            Some("protocol version mismatch")
        } else if greeting.network != network {
            Some("wrong network")
        } else if greeting.id == own_id {
            Some("peer id collision")
        } else {
            None
        };
        if let Some(reason) = reject {
            self.close_connection(via, reason);
            return;
        }

        let Some(conn) = self.connections.get_mut(&via) else { return };
        conn.greeting_received = true;
        conn.peer = Some(greeting.id);
        conn.force_broadcast = greeting.flags & connect_flags::FORCE_BCAST != 0;
        conn.forced_bw = greeting.flags & connect_flags::FORCED_BW != 0;
        conn.forced_cl = greeting.flags & connect_flags::FORCED_CL != 0;
        conn.last_activity = now;

        if conn.greeting_sent {
            conn.state = ConnState::Established;
            log::info!("kernel: link {via} established to peer {}", greeting.id);
            self.on_established(via);
        }
    }

    /// A fresh neighbor gets our host record and a full routing
    /// advertisement right away instead of waiting for the periodics.
    fn on_established(&mut self, via: ConnId) {
        let info = self.my_hostinfo();
        if let Ok(payload) = info.to_bytes() {
            let _ = self.send_link_local(via, port::HOSTINFO, payload, PackageFlags::default());
        }

        let cost = match self.connections.get(&via) {
            Some(conn) => conn.cost,
            None => return,
        };
        let pages = self.router.build_pages(cost, self.config.metric_giveup);
        for page in pages {
            if let Ok(payload) = page.to_bytes() {
                let _ = self.send_link_local(via, port::ROUTING, payload, PackageFlags::default());
            }
        }
    }

    pub(crate) fn handle_package(&mut self, via: ConnId, package: Package, wire_len: usize) {
        let now = self.clock.now();

        if let Some(conn) = self.connections.get_mut(&via) {
            conn.note_received(&package, wire_len, now);
        }

        // Artificial loss injection for testing.
        let loss = self.config.package_loss;
        if loss > 0.0 && self.rng.gen::<f64>() < loss {
            return;
        }

        if self.loopstore.seen(package.id) {
            log::trace!("kernel: duplicate {} dropped", package.id);
            return;
        }
        self.loopstore.remember(package.id);

        self.note_peer_traffic(&package, wire_len);

        match package.package_type {
            PackageType::LinkLocal => {
                self.deliver_local(package, Some(via));
            }
            PackageType::Directed => {
                if package.destination == self.own_id {
                    self.deliver_local(package, Some(via));
                } else {
                    self.forward(via, package);
                }
            }
            PackageType::Broadcast => {
                let mut onward = package.clone();
                self.deliver_local(package, Some(via));
                if onward.hops < BROADCAST_HOP_LIMIT {
                    onward.hops += 1;
                    self.flood(onward, Some(via));
                }
            }
        }
    }

    /// Attributes useful bytes to the far endpoints of a package, whether
    /// we terminate it or merely relay it. Meta ports do not count.
    fn note_peer_traffic(&mut self, package: &Package, wire_len: usize) {
        if package.port <= port::HIGHEST_META {
            return;
        }
        for endpoint in [package.source, package.destination] {
            if endpoint.is_valid() && endpoint != self.own_id {
                *self.peer_traffic.entry(endpoint).or_insert(0) += wire_len as u64;
            }
        }
    }

    fn deliver_local(&mut self, package: Package, via: Option<ConnId>) {
        if package.wants_ack() && package.destination == self.own_id {
            let full =
                self.ackmgr.schedule(package.source, package.ack_id, package.is_hipri());
            if full {
                self.flush_acks_for(package.source);
            }
        }

        // Retransmissions carry fresh package ids but keep their ack id;
        // the ack above still goes out, the content only lands once.
        if package.ack_id != package.id {
            if self.loopstore.seen(package.ack_id) {
                return;
            }
            self.loopstore.remember(package.ack_id);
        }

        if package.is_fragment() {
            let now = self.clock.now();
            if let Some(payload) = self.reassembly.ingest(&package, now) {
                let mut whole = package;
                whole.payload = payload;
                whole.seq_len = 0;
                whole.seq_num = 0;
                self.deliveries.push_back(Delivery { package: whole, via });
            }
            return;
        }

        self.deliveries.push_back(Delivery { package, via });
    }

    fn forward(&mut self, via: ConnId, mut package: Package) {
        if package.hops == u8::MAX {
            return;
        }
        package.hops += 1;

        // Trace requests collect the id of every hop they cross.
        if package.port == port::TRACE {
            let mut payload = package.payload;
            payload.extend_from_slice(&self.own_id.0.to_be_bytes());
            package.payload = payload;
        }

        let Some(next) = self.router.route_for(&package.destination) else {
            log::debug!(
                "kernel: no route to forward {} -> {}",
                package.source,
                package.destination
            );
            return;
        };
        if next == via {
            // Routing ping-pong guard; the advertisement that caused this
            // will correct itself.
            return;
        }
        let _ = self.enqueue_on(next, package, None);
    }

    /// Stochastic flood: a bounded random subset of links, the arrival
    /// link excluded, forced-broadcast links always included.
    pub(crate) fn flood(&mut self, package: Package, exclude: Option<ConnId>) {
        let mut forced: Vec<ConnId> = Vec::new();
        let mut optional: Vec<ConnId> = Vec::new();
        for (id, conn) in &self.connections {
            if Some(*id) == exclude || !conn.is_established() {
                continue;
            }
            if conn.force_broadcast {
                forced.push(*id);
            } else {
                optional.push(*id);
            }
        }

        let fanout = self.config.broadcast_fanout;
        if self.config.stochastic_broadcast && optional.len() > fanout {
            // Partial Fisher-Yates: the first `fanout` slots are the pick.
            for slot in 0..fanout {
                let other = self.rng.gen_range(slot..optional.len());
                optional.swap(slot, other);
            }
            optional.truncate(fanout);
        }

        forced.extend(optional);
        for id in forced {
            let _ = self.enqueue_on(id, package.clone(), None);
        }
    }

    // ---- outbound -----------------------------------------------------

    pub(crate) fn enqueue_on(
        &mut self,
        conn_id: ConnId,
        package: Package,
        callback: Option<AckFn>,
    ) -> Result<(), NetError> {
        let now = self.clock.now();
        let mut queued = match self.pool.allocate(package, now) {
            Ok(queued) => queued,
            Err(err) => {
                if let Some(callback) = callback {
                    callback(DeliveryStatus::QueueFull);
                }
                return Err(err);
            }
        };
        if let Some(callback) = callback {
            queued.add_callback(callback)?;
        }

        let Some(conn) = self.connections.get_mut(&conn_id) else {
            queued.resolve(DeliveryStatus::ConnectionClosed);
            return Err(NetError::UnknownConnection);
        };

        match conn.enqueue(queued, &mut self.rng) {
            Ok(()) => Ok(()),
            Err((queued, status)) => {
                queued.resolve(status);
                Err(match status {
                    DeliveryStatus::RedDrop => NetError::RedDrop,
                    _ => NetError::QueueFull,
                })
            }
        }
    }

    pub(crate) fn drain_outbound(&mut self) {
        let now = self.clock.now();
        let own_id = self.own_id;
        let base_retry = self.config.base_retry();
        let max_retries = self.config.max_retries;

        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else { continue };
            if !conn.drain(now, own_id, base_retry, max_retries, &mut self.rng) {
                self.close_connection(id, "send failed");
            }
        }
    }

    // ---- public send surface ------------------------------------------

    fn fresh_package(
        &mut self,
        package_type: PackageType,
        destination: PeerId,
        service: u16,
        payload: Vec<u8>,
        flags: PackageFlags,
    ) -> Package {
        let mut package = Package::new(package_type, self.own_id, destination);
        package.id = draw_package_id(&mut self.rng);
        package.ack_id = package.id;
        package.port = service;
        package.flags = flags;
        package.payload = payload;
        self.note_peer_traffic(&package, package.wire_len());
        package
    }

    /// Best-effort single-package send toward a routed destination.
    pub fn send_message(
        &mut self,
        destination: PeerId,
        service: u16,
        payload: Vec<u8>,
        flags: PackageFlags,
    ) -> Result<(), NetError> {
        if payload.len() > MAX_PAYLOAD {
            return self.send_long(destination, service, payload, flags, None);
        }

        let package =
            self.fresh_package(PackageType::Directed, destination, service, payload, flags);

        if destination == self.own_id {
            self.deliver_local(package, None);
            return Ok(());
        }

        let next = self.router.route_for(&destination).ok_or(NetError::NoRoute)?;
        self.enqueue_on(next, package, None)
    }

    /// Reliable send: retransmitted until acknowledged or the retry budget
    /// is gone, resolving the callback exactly once either way. Payloads
    /// beyond one package are fragmented transparently.
    pub fn send_reliable(
        &mut self,
        destination: PeerId,
        service: u16,
        payload: Vec<u8>,
        callback: Option<AckFn>,
    ) -> Result<(), NetError> {
        let mut flags = PackageFlags::default();
        flags.insert(PackageFlags::REQUEST_ACK);

        if payload.len() > MAX_PAYLOAD {
            return self.send_long(destination, service, payload, flags, callback);
        }

        let mut package =
            self.fresh_package(PackageType::Directed, destination, service, payload, flags);
        package.ack_id = draw_package_id(&mut self.rng);

        if destination == self.own_id {
            self.deliver_local(package, None);
            if let Some(callback) = callback {
                callback(DeliveryStatus::Acked);
            }
            return Ok(());
        }

        let next = match self.router.route_for(&destination) {
            Some(next) => next,
            None => {
                if let Some(callback) = callback {
                    callback(DeliveryStatus::NoRoute);
                }
                return Err(NetError::NoRoute);
            }
        };
        self.enqueue_on(next, package, callback)
    }

    /// Fragments an oversized payload into one sequence. When sent
    /// reliably, the caller's callback aggregates over the fragments:
    /// success only after every fragment is acknowledged, failure on the
    /// first fragment that gives up.
    fn send_long(
        &mut self,
        destination: PeerId,
        service: u16,
        payload: Vec<u8>,
        flags: PackageFlags,
        callback: Option<AckFn>,
    ) -> Result<(), NetError> {
        let seq_len = payload.len().div_ceil(MAX_PAYLOAD);
        if seq_len > u16::MAX as usize {
            if let Some(callback) = callback {
                callback(DeliveryStatus::QueueFull);
            }
            return Err(NetError::TooLarge);
        }

        // Admission: refuse the whole message unless all fragments are
        // likely to clear the early-detection curve together.
        let capacity = self.config.queue_capacity as f64;
        let survival = red_survival(seq_len as f64 / capacity);
        if survival.powi(seq_len as i32) < 0.8 {
            log::debug!(
                "kernel: long message of {seq_len} fragments refused by admission check"
            );
            if let Some(callback) = callback {
                callback(DeliveryStatus::RedDrop);
            }
            return Err(NetError::RedDrop);
        }

        let next = match self.router.route_for(&destination) {
            Some(next) => next,
            None if destination == self.own_id => {
                // Local long message: deliver whole, no fragmentation.
                let mut package = self.fresh_package(
                    PackageType::Directed,
                    destination,
                    service,
                    payload,
                    flags,
                );
                package.seq_len = 0;
                self.deliveries.push_back(Delivery { package, via: None });
                if let Some(callback) = callback {
                    callback(DeliveryStatus::Acked);
                }
                return Ok(());
            }
            None => {
                if let Some(callback) = callback {
                    callback(DeliveryStatus::NoRoute);
                }
                return Err(NetError::NoRoute);
            }
        };

        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        let seq_id = self.next_seq_id;

        let reliable = flags.contains(PackageFlags::REQUEST_ACK);
        let aggregate = callback.map(|callback| {
            Arc::new(Mutex::new(LongSendState {
                remaining: seq_len,
                failed: false,
                callback: Some(callback),
            }))
        });

        for (index, chunk) in payload.chunks(MAX_PAYLOAD).enumerate() {
            let mut package = self.fresh_package(
                PackageType::Directed,
                destination,
                service,
                chunk.to_vec(),
                flags,
            );
            package.seq_len = seq_len as u16;
            package.seq_id = seq_id;
            package.seq_num = index as u16;
            if reliable {
                package.ack_id = draw_package_id(&mut self.rng);
            }

            let fragment_callback: Option<AckFn> = aggregate.as_ref().map(|state| {
                let state = state.clone();
                Box::new(move |status: DeliveryStatus| {
                    let Ok(mut state) = state.lock() else { return };
                    if status.is_success() {
                        state.remaining -= 1;
                        if state.remaining == 0 && !state.failed {
                            if let Some(callback) = state.callback.take() {
                                callback(DeliveryStatus::Acked);
                            }
                        }
                    } else if !state.failed {
                        state.failed = true;
                        if let Some(callback) = state.callback.take() {
                            callback(status);
                        }
                    }
                }) as AckFn
            });

            self.enqueue_on(next, package, fragment_callback)?;
        }

        Ok(())
    }

    /// Sends on one specific link, regardless of routing.
    pub fn send_link_local(
        &mut self,
        conn_id: ConnId,
        service: u16,
        payload: Vec<u8>,
        flags: PackageFlags,
    ) -> Result<(), NetError> {
        let peer = self
            .connections
            .get(&conn_id)
            .and_then(|conn| conn.peer)
            .unwrap_or(PeerId::BROADCAST);
        let package =
            self.fresh_package(PackageType::LinkLocal, peer, service, payload, flags);
        self.enqueue_on(conn_id, package, None)
    }

    /// Floods a package to the whole overlay.
    pub fn broadcast(
        &mut self,
        service: u16,
        payload: Vec<u8>,
        flags: PackageFlags,
    ) -> Result<(), NetError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(NetError::TooLarge);
        }
        let package = self.fresh_package(
            PackageType::Broadcast,
            PeerId::BROADCAST,
            service,
            payload,
            flags,
        );
        // Remember our own id: the flood may travel a cycle and come back.
        self.loopstore.remember(package.id);
        // Our own hooks see broadcasts too.
        self.deliver_local(package.clone(), None);
        self.flood(package, None);
        Ok(())
    }

    // ---- acks ---------------------------------------------------------

    pub(crate) fn flush_acks_for(&mut self, destination: PeerId) {
        if let Some(bundle) = self.ackmgr.take_bundle(&destination) {
            self.send_ack_bundle(destination, bundle);
        }
    }

    pub(crate) fn flush_acks(&mut self) {
        for (destination, bundle) in self.ackmgr.take_all() {
            self.send_ack_bundle(destination, bundle);
        }
    }

    fn send_ack_bundle(&mut self, destination: PeerId, bundle: crate::ackmgr::AckBundle) {
        let Ok(payload) = bundle.to_bytes() else { return };
        let mut flags = PackageFlags(0);
        flags.insert(PackageFlags::IS_ACK);
        if bundle.priority {
            flags.insert(PackageFlags::REQUEST_ACK);
            flags.insert(PackageFlags::HIPRI);
        }
        if let Err(err) =
            self.send_message(destination, port::ACKNOWLEDGEMENTS, payload, flags)
        {
            log::debug!("kernel: ack bundle to {destination} undeliverable: {err}");
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn close_connection(&mut self, id: ConnId, reason: &str) {
        let Some(mut conn) = self.connections.remove(&id) else { return };
        log::info!("kernel: closing {id} ({reason})");
        conn.close();

        for autohost in &mut self.autohosts {
            if autohost.conn == Some(id) {
                autohost.conn = None;
            }
        }

        let events = self.router.connection_lost(&self.connections, id);
        self.apply_route_events(events);
    }

    pub(crate) fn apply_route_events(&mut self, events: Vec<RouteEvent>) {
        for event in events {
            match event {
                RouteEvent::NewPeer(peer) => {
                    log::debug!("kernel: learned of peer {peer}");
                }
                RouteEvent::RouteLost(peer) => {
                    log::debug!("kernel: route to {peer} entered countdown");
                }
                RouteEvent::RouteDied(peer) => {
                    self.announce_dead(peer, DeadHostReason::RouteAgedOut);
                    self.declare_dead(peer, DeadHostReason::RouteAgedOut);
                }
                RouteEvent::Reborn { peer, old_magic, new_magic } => {
                    log::info!(
                        "kernel: peer {peer} reborn ({old_magic} -> {new_magic})"
                    );
                    self.declare_dead(peer, DeadHostReason::Reborn);
                }
            }
        }
    }

    /// Spreads a death notification so the overlay purges in one round
    /// instead of waiting for every table to age out.
    pub(crate) fn announce_dead(&mut self, peer: PeerId, reason: DeadHostReason) {
        let magic = self.hosts.get(&peer).map(|info| info.magic).unwrap_or_default();
        let mut payload = Vec::with_capacity(9);
        payload.extend_from_slice(&peer.0.to_be_bytes());
        payload.extend_from_slice(&magic.0.to_be_bytes());
        payload.push(reason as u8);
        let _ = self.broadcast(port::DEAD_HOST, payload, PackageFlags::default());
    }

    /// The dead-host cascade: host record, routes, direct links, partial
    /// messages and owed acks all go; user callbacks hear about real
    /// disappearances but not incarnation changes.
    pub(crate) fn declare_dead(&mut self, peer: PeerId, reason: DeadHostReason) {
        log::info!("kernel: peer {peer} declared dead ({reason:?})");
        self.hosts.remove(&peer);
        if reason != DeadHostReason::Reborn {
            self.router.purge(&peer);
        }
        self.ackmgr.purge(&peer);
        self.reassembly.purge_source(peer);

        for id in self.connections_to(peer) {
            self.close_connection(id, "peer declared dead");
        }

        if reason != DeadHostReason::Reborn {
            let mut hooks = std::mem::take(&mut self.deadhost_hooks);
            for hook in hooks.iter_mut() {
                hook(peer, reason);
            }
            self.deadhost_hooks = hooks;
        }
    }

    // ---- time ---------------------------------------------------------

    /// Applies a clock correction. Jumps beyond half a second also shift
    /// every connection stamp and, via the step, the periodic timers.
    pub fn adjust_clock(&mut self, delta_micros: i64) {
        self.clock.adjust(delta_micros);
        if delta_micros.abs() > TIME_SHIFT_EPSILON_MICROS {
            for conn in self.connections.values_mut() {
                conn.shift_time(delta_micros);
            }
            self.pending_time_shift += delta_micros;
        }
    }

    // ---- maintenance entry points (driven by periodics) ---------------

    /// One routing period: bump and advertise the own entry, age lost
    /// routes, emit pages to every neighbor, chase missing host records,
    /// recompute the cluster witness.
    pub fn router_tick(&mut self) {
        let established = self.established_count() as u8;
        self.router.advertise_self(self.own_id, self.own_magic, established);

        let events = self.router.age_outdated();
        self.apply_route_events(events);

        let targets: Vec<(ConnId, u8)> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_established())
            .map(|(id, conn)| (*id, conn.cost))
            .collect();
        for (id, cost) in targets {
            for page in self.router.build_pages(cost, self.config.metric_giveup) {
                if let Ok(payload) = page.to_bytes() {
                    let _ =
                        self.send_link_local(id, port::ROUTING, payload, PackageFlags::default());
                }
            }
        }

        self.query_missing_hosts();

        let cluster = self.router.cluster(self.own_id);
        if cluster != self.cluster {
            log::info!("kernel: cluster witness changed {} -> {}", self.cluster, cluster);
            self.cluster = cluster;
            self.beacon_tick();
        }
    }

    /// Chases routing entries we cannot name: no host record, or a host
    /// record whose incarnation no longer matches the routes.
    fn query_missing_hosts(&mut self) {
        self.router.tick_query_countdowns();

        let mut queries = Vec::new();
        let own_id = self.own_id;
        for (dest, entry) in self.router.iter() {
            if *dest == own_id || !entry.is_usable() {
                continue;
            }
            let missing = match self.hosts.get(dest) {
                None => true,
                Some(info) => info.magic != entry.magic,
            };
            if missing && entry.query_countdown == 0 {
                queries.push(*dest);
            }
        }

        for dest in &queries {
            if let Some(entry) = self.router.entry_mut(dest) {
                entry.query_countdown = 3;
            }
        }

        for dest in queries {
            log::debug!("kernel: querying host record of {dest}");
            let _ = self.send_message(dest, port::QUERY_HOST, Vec::new(), PackageFlags::default());
        }
    }

    pub(crate) fn reassembly_expire(&mut self) {
        let now = self.clock.now();
        self.reassembly.expire(now);
    }

    /// Re-dials configured rendezvous hosts that lost their link.
    pub fn autohost_tick(&mut self) {
        let now = self.clock.now();
        let retry = Duration::from_secs_f64(self.config.autohost_retry_period);
        let due: Vec<(usize, LinkUrl)> = self
            .autohosts
            .iter()
            .enumerate()
            .filter(|(_, autohost)| {
                autohost.conn.is_none()
                    && !autohost.dialing
                    && now - autohost.last_attempt >= retry.as_micros() as i64
            })
            .map(|(index, autohost)| (index, autohost.url.clone()))
            .collect();

        for (index, url) in due {
            if let Err(err) = self.dial(url.clone(), Some(index)) {
                log::debug!("kernel: autohost dial {url} failed to start: {err}");
            }
        }
    }

    /// Everyone's host record, ours included, built fresh from the
    /// listeners and the current cluster.
    pub fn my_hostinfo(&self) -> HostInfo {
        let mut info = HostInfo::new(
            self.own_id,
            self.own_magic,
            &self.config.hostname,
            &self.config.fullname,
        );
        info.network_cluster = self.cluster;
        info.last_seen = self.clock.now();
        for listener in &self.listeners {
            for address in listener.local_addresses() {
                if info.push_address(address.clone()).is_err() {
                    break;
                }
            }
        }
        info
    }
}

/// Public kernel handle: the core, the hook registry and the periodic
/// scheduler, driven by [`Kernel::step`].
pub struct Kernel {
    core: KernelCore,
    dispatcher: Dispatcher,
    periodics: PeriodicScheduler,
}

impl Kernel {
    pub fn new(config: NetConfig) -> Self {
        Self::with_clock(config, Clock::system())
    }

    pub fn with_clock(config: NetConfig, clock: Clock) -> Self {
        let core = KernelCore::with_clock(config, clock);
        let mut dispatcher = Dispatcher::new();
        crate::services::register_builtin(&mut dispatcher);

        let mut periodics = PeriodicScheduler::new();
        register_builtin_periodics(&mut periodics, &core.config);

        Self { core, dispatcher, periodics }
    }

    pub fn core(&self) -> &KernelCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    pub fn register_hook(&mut self, service: u16, hook: HookFn) {
        self.dispatcher.register(service, hook);
    }

    pub fn register_periodic(&mut self, name: &str, period: Duration, hook: PeriodicFn) {
        self.periodics.register(name, period, hook);
    }

    pub fn shutdown(&mut self) {
        self.core.shutdown = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown
    }

    fn dispatch_pending(&mut self) {
        while let Some(delivery) = self.core.deliveries.pop_front() {
            self.dispatcher.dispatch(&delivery.package, delivery.via, &mut self.core);
        }
    }

    /// One cooperative kernel step: accept, receive and dispatch, run due
    /// periodics, drain outgoing queues. Never blocks.
    pub fn step(&mut self) {
        if self.core.shutdown {
            return;
        }

        self.core.accept_inbound();
        self.core.poll_dials();
        self.core.pump_inbound();
        self.core.pump_beacons();
        self.dispatch_pending();

        self.periodics.run_due(&mut self.core);
        self.dispatch_pending();

        self.core.drain_outbound();

        let shift = std::mem::take(&mut self.core.pending_time_shift);
        if shift != 0 {
            self.periodics.shift_time(shift);
        }
    }

    /// Sleep budget until something is due, capped at the idle bound.
    pub fn idle_budget(&self) -> Duration {
        let cap = Duration::from_millis(10);
        self.periodics
            .next_due_in(self.core.clock.now())
            .map(|due| due.min(cap))
            .unwrap_or(cap)
    }
}

fn register_builtin_periodics(periodics: &mut PeriodicScheduler, config: &NetConfig) {
    periodics.register(
        "route-broadcast",
        Duration::from_secs_f64(config.route_broadcast_period),
        Box::new(|core| core.router_tick()),
    );
    periodics.register(
        "connection-manager",
        Duration::from_secs_f64(config.connmgr_period),
        Box::new(|core| core.connmgr_tick()),
    );
    periodics.register(
        "cluster-check",
        Duration::from_secs_f64(config.cluster_check_period),
        Box::new(|core| core.cluster_tick()),
    );
    periodics.register(
        "beacon",
        Duration::from_secs_f64(config.beacon_period),
        Box::new(|core| core.beacon_tick()),
    );
    periodics.register(
        "hostinfo-gossip",
        Duration::from_secs_f64(config.hostinfo_period),
        Box::new(|core| core.hostinfo_tick()),
    );
    periodics.register(
        "acknowledgements",
        Duration::from_millis(100),
        Box::new(|core| core.flush_acks()),
    );
    periodics.register(
        "timesync",
        Duration::from_secs_f64(config.timesync_period),
        Box::new(|core| core.timesync_tick()),
    );
    periodics.register(
        "reassembly-expiry",
        Duration::from_secs(1),
        Box::new(|core| core.reassembly_expire()),
    );
    periodics.register(
        "autohosts",
        Duration::from_secs_f64(config.autohost_retry_period),
        Box::new(|core| core.autohost_tick()),
    );
}

/// Owns a dedicated stepping thread; API calls from other threads
/// serialise through the internal lock.
pub struct ThreadedKernel {
    shared: Arc<Mutex<Kernel>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl ThreadedKernel {
    pub fn spawn(kernel: Kernel) -> Self {
        let shared = Arc::new(Mutex::new(kernel));
        let worker_shared = shared.clone();

        let worker = std::thread::Builder::new()
            .name("mycel-kernel".to_string())
            .spawn(move || loop {
                let budget = {
                    let Ok(mut kernel) = worker_shared.lock() else { break };
                    if kernel.is_shutdown() {
                        break;
                    }
                    kernel.step();
                    kernel.idle_budget()
                };
                std::thread::sleep(budget);
            })
            .expect("kernel worker thread");

        Self { shared, worker: Some(worker) }
    }

    /// Runs `action` against the kernel under the lock.
    pub fn with<R>(&self, action: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut kernel = match self.shared.lock() {
            Ok(kernel) => kernel,
            Err(poisoned) => poisoned.into_inner(),
        };
        action(&mut kernel)
    }

    pub fn stop(mut self) {
        self.with(|kernel| kernel.shutdown());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadedKernel {
    fn drop(&mut self) {
        self.with(|kernel| kernel.shutdown());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
