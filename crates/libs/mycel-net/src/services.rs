//! Built-in meta services, expressed as ordinary port hooks: routing
//! ingest, acknowledgement matching, host records, death notices, time
//! synchronisation, trace and neighbour introspection.

use mycel_core::package::port;
use mycel_core::{HostInfo, InputBuffer, OutputBuffer, Package, PackageFlags, PeerId, Wire};

use crate::ackmgr::AckBundle;
use crate::connection::ConnId;
use crate::dispatcher::{Dispatcher, HookAction};
use crate::error::DeadHostReason;
use crate::kernel::KernelCore;
use crate::router::RoutingPage;

pub fn register_builtin(dispatcher: &mut Dispatcher) {
    dispatcher.register(port::ROUTING, Box::new(routing_hook));
    dispatcher.register(port::ACKNOWLEDGEMENTS, Box::new(ack_hook));
    dispatcher.register(port::HOSTINFO, Box::new(hostinfo_hook));
    dispatcher.register(port::QUERY_HOST, Box::new(query_host_hook));
    dispatcher.register(port::DEAD_HOST, Box::new(dead_host_hook));
    dispatcher.register(port::TIMESYNC, Box::new(timesync_hook));
    dispatcher.register(port::TRACE, Box::new(trace_hook));
    dispatcher.register(port::NEIGHBOURS, Box::new(neighbours_hook));
}

/// Routing pages are collected per link until the advertisement round is
/// complete, then folded into the tables.
fn routing_hook(package: &Package, via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let Some(via) = via else { return HookAction::Stop };
    let Ok(page) = RoutingPage::from_bytes(&package.payload) else {
        log::debug!("services: malformed routing page from {via}");
        return HookAction::Stop;
    };

    let own_id = core.own_id;
    let complete = {
        let Some(conn) = core.connections.get_mut(&via) else { return HookAction::Stop };
        let stale = conn
            .route_pages
            .as_ref()
            .map(|assembly| assembly.sequence() != page.sequence)
            .unwrap_or(true);
        if stale {
            conn.route_pages =
                Some(crate::router::PageAssembly::new(page.sequence, page.total_pages));
        }
        conn.route_pages.as_mut().and_then(|assembly| assembly.ingest(page))
    };

    if let Some(entries) = complete {
        if let Some(conn) = core.connections.get_mut(&via) {
            conn.route_pages = None;
        }
        let events =
            core.router.apply_advertisement(&mut core.connections, via, entries, own_id);
        core.apply_route_events(events);
    }
    HookAction::Stop
}

/// One ack bundle settles any number of reliable sends: each id is pulled
/// out of whichever retry store still holds it and resolved successfully.
fn ack_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let Ok(bundle) = AckBundle::from_bytes(&package.payload) else {
        log::debug!("services: malformed ack bundle from {}", package.source);
        return HookAction::Stop;
    };

    for ack_id in bundle.acks {
        let mut settled = false;
        for conn in core.connections.values_mut() {
            if let Some(queued) = conn.take_pending(ack_id) {
                queued.resolve(crate::error::DeliveryStatus::Acked);
                settled = true;
                break;
            }
        }
        if !settled {
            log::trace!("services: ack {ack_id} matched nothing (already settled?)");
        }
    }
    HookAction::Stop
}

fn hostinfo_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    match HostInfo::from_bytes(&package.payload) {
        Ok(info) => core.ingest_hostinfo(info),
        Err(_) => log::debug!("services: malformed host record from {}", package.source),
    }
    HookAction::Stop
}

/// A host query wants our record, directed back at the asker.
fn query_host_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let info = core.my_hostinfo();
    if let Ok(payload) = info.to_bytes() {
        let _ =
            core.send_message(package.source, port::HOSTINFO, payload, PackageFlags::default());
    }
    HookAction::Stop
}

/// Death notice: `id | magic | reason`. Only honoured when the magic
/// matches what we believe, so a stale notice cannot kill a live rebirth.
fn dead_host_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let mut input = InputBuffer::new(&package.payload);
    let (Ok(peer), Ok(magic)) = (input.read_i32(), input.read_u32()) else {
        return HookAction::Stop;
    };
    let reason = input
        .read_byte()
        .ok()
        .and_then(DeadHostReason::from_wire)
        .unwrap_or(DeadHostReason::DeathMessage);
    let peer = PeerId(peer);

    if peer == core.own_id {
        // Reports of our death are premature; the next beacon corrects it.
        return HookAction::Stop;
    }

    let magic_matches = core
        .hosts
        .get(&peer)
        .map(|info| info.magic.0 == magic)
        .unwrap_or(true);
    if magic_matches {
        core.declare_dead(peer, reason);
        if reason == DeadHostReason::Reborn {
            // Any entry we hold still belongs to the old incarnation; its
            // sequence numbers would outrank the restarted peer's.
            core.router.purge(&peer);
        }
    }
    HookAction::Stop
}

/// Non-masters slew their clock toward the master's announcements.
fn timesync_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    if core.config.time_master {
        return HookAction::Stop;
    }
    let mut input = InputBuffer::new(&package.payload);
    let (Ok(secs), Ok(micros)) = (input.read_i64(), input.read_u32()) else {
        return HookAction::Stop;
    };

    let master = mycel_core::Timestamp::from_parts(secs, micros);
    let delta = master - core.clock.now();
    if delta != 0 {
        log::debug!("services: time sync adjusts clock by {delta} us");
        core.adjust_clock(delta);
    }
    HookAction::Stop
}

/// A trace request has collected the id of every hop on its way here; we
/// append ourselves and return the list.
fn trace_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let mut hops = package.payload.clone();
    hops.extend_from_slice(&core.own_id.0.to_be_bytes());
    let _ = core.send_message(package.source, port::TRACE_REPLY, hops, PackageFlags::default());
    HookAction::Stop
}

/// Answers with our direct links: peer, cost and useful-byte estimate.
fn neighbours_hook(package: &Package, _via: Option<ConnId>, core: &mut KernelCore) -> HookAction {
    let now = core.clock.now();
    let links: Vec<(PeerId, u8, u32)> = core
        .connections
        .values()
        .filter(|conn| conn.is_established())
        .filter_map(|conn| {
            conn.peer.map(|peer| (peer, conn.cost, conn.useful_rate(now) as u32))
        })
        .collect();

    let mut raw = vec![0u8; 2 + links.len() * 9];
    let mut out = OutputBuffer::new(&mut raw);
    let written = (|| {
        out.write_u16(links.len() as u16)?;
        for (peer, cost, rate) in &links {
            peer.serialize(&mut out)?;
            out.write_byte(*cost)?;
            out.write_u32(*rate)?;
        }
        Ok::<usize, mycel_core::CoreError>(out.offset())
    })();

    if let Ok(len) = written {
        raw.truncate(len);
        let _ =
            core.send_message(package.source, port::NEIGHBOURS_REPLY, raw, PackageFlags::default());
    }
    HookAction::Stop
}

impl KernelCore {
    /// Master side of time synchronisation: announce the reference clock.
    pub fn timesync_tick(&mut self) {
        if !self.config.time_master {
            return;
        }
        let now = self.clock.now();
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&now.secs().to_be_bytes());
        payload.extend_from_slice(&now.subsec_micros().to_be_bytes());
        let _ = self.broadcast(port::TIMESYNC, payload, PackageFlags::default());
    }
}
