//! Sequenced distance-vector routing. Each peer periodically advertises
//! its whole table with a bumped sequence number; receivers fold the
//! advertisement into a per-link view and promote entries into the global
//! table under the rule that `(sequence, -hops)` may only improve, except
//! along the currently selected next hop, whose word is always taken.
//! Routes that lose their link walk a reserved hop-count band down to
//! deletion so that loss propagates instead of lingering.

use std::collections::HashMap;

use mycel_core::{CoreError, InputBuffer, Magic, OutputBuffer, PeerId, Wire};

use crate::connection::{ConnId, Connection};

pub const ROUTE_ENTRIES_PER_PAGE: usize = 70;

/// Advertised hop count meaning "not reachable through me".
pub const HOPS_UNREACHABLE: u8 = 255;
/// Outdated band: a lost route counts 250..=254 across routing periods,
/// then disappears.
pub const HOPS_OUTDATED_FIRST: u8 = 250;
pub const HOPS_OUTDATED_LAST: u8 = 254;

/// What a neighbor last claimed about one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRoute {
    pub seq: i32,
    pub hops: u8,
    pub magic: Magic,
    pub adv_connections: u8,
}

/// One fixed-layout advertisement entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdv {
    pub dest: PeerId,
    pub seq: i32,
    pub magic: Magic,
    pub hops: u8,
    pub adv_connections: u8,
}

impl RouteAdv {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        self.dest.serialize(buffer)?;
        buffer.write_i32(self.seq)?;
        self.magic.serialize(buffer)?;
        buffer.write_byte(self.hops)?;
        buffer.write_byte(self.adv_connections)?;
        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        Ok(Self {
            dest: PeerId::deserialize(buffer)?,
            seq: buffer.read_i32()?,
            magic: Magic::deserialize(buffer)?,
            hops: buffer.read_byte()?,
            adv_connections: buffer.read_byte()?,
        })
    }
}

/// One page of a routing advertisement. A full advertisement is the set
/// of pages sharing a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPage {
    pub page_index: u8,
    pub total_pages: u8,
    pub sequence: i32,
    pub entries: Vec<RouteAdv>,
}

impl Wire for RoutingPage {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        if self.entries.len() > ROUTE_ENTRIES_PER_PAGE {
            return Err(CoreError::InvalidArgument);
        }
        buffer.write_byte(self.page_index)?;
        buffer.write_byte(self.total_pages)?;
        buffer.write_byte(self.entries.len() as u8)?;
        buffer.write_i32(self.sequence)?;
        for entry in &self.entries {
            entry.serialize(buffer)?;
        }
        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let page_index = buffer.read_byte()?;
        let total_pages = buffer.read_byte()?;
        let count = buffer.read_byte()? as usize;
        let sequence = buffer.read_i32()?;
        if count > ROUTE_ENTRIES_PER_PAGE {
            return Err(CoreError::Malformed);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(RouteAdv::deserialize(buffer)?);
        }
        Ok(Self { page_index, total_pages, sequence, entries })
    }
}

/// Collects the pages of one advertisement round until all have arrived.
pub struct PageAssembly {
    sequence: i32,
    received: Vec<bool>,
    entries: Vec<RouteAdv>,
}

impl PageAssembly {
    pub fn new(sequence: i32, total_pages: u8) -> Self {
        Self { sequence, received: vec![false; total_pages.max(1) as usize], entries: Vec::new() }
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    /// Folds a page in; returns the full entry set once every page of the
    /// round has been seen.
    pub fn ingest(&mut self, page: RoutingPage) -> Option<Vec<RouteAdv>> {
        if page.sequence != self.sequence
            || page.total_pages as usize != self.received.len()
            || page.page_index >= page.total_pages
        {
            return None;
        }

        let index = page.page_index as usize;
        if !self.received[index] {
            self.received[index] = true;
            self.entries.extend(page.entries);
        }

        if self.received.iter().all(|&got| got) {
            return Some(std::mem::take(&mut self.entries));
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingEntry {
    pub seq: i32,
    pub hops: u8,
    pub magic: Magic,
    pub conn: Option<ConnId>,
    pub adv_connections: u8,
    /// Periods until the next host query may be sent for this entry.
    pub query_countdown: u8,
}

impl RoutingEntry {
    pub fn goodness(&self) -> i64 {
        self.seq as i64 - self.hops as i64
    }

    pub fn is_outdated(&self) -> bool {
        (HOPS_OUTDATED_FIRST..=HOPS_OUTDATED_LAST).contains(&self.hops)
    }

    pub fn is_usable(&self) -> bool {
        self.hops < HOPS_OUTDATED_FIRST
    }
}

/// Observable routing changes the kernel reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEvent {
    NewPeer(PeerId),
    /// Route entered the outdated band.
    RouteLost(PeerId),
    /// Outdated band exhausted; the peer is gone.
    RouteDied(PeerId),
    /// Same id came back with a different magic.
    Reborn { peer: PeerId, old_magic: Magic, new_magic: Magic },
}

pub struct Router {
    table: HashMap<PeerId, RoutingEntry>,
    own_seq: i32,
}

impl Router {
    pub fn new() -> Self {
        Self { table: HashMap::new(), own_seq: 0 }
    }

    pub fn own_seq(&self) -> i32 {
        self.own_seq
    }

    pub fn entry(&self, dest: &PeerId) -> Option<&RoutingEntry> {
        self.table.get(dest)
    }

    pub fn entry_mut(&mut self, dest: &PeerId) -> Option<&mut RoutingEntry> {
        self.table.get_mut(dest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &RoutingEntry)> {
        self.table.iter()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Next hop for a destination, or None when the route is missing or in
    /// the outdated band.
    pub fn route_for(&self, dest: &PeerId) -> Option<ConnId> {
        self.table.get(dest).filter(|entry| entry.is_usable()).and_then(|entry| entry.conn)
    }

    pub fn remove(&mut self, dest: &PeerId) -> Option<RoutingEntry> {
        self.table.remove(dest)
    }

    /// Bumps the own sequence number and rewrites the self entry; run at
    /// the start of every routing period.
    pub fn advertise_self(&mut self, own_id: PeerId, own_magic: Magic, num_connections: u8) {
        self.own_seq = self.own_seq.wrapping_add(1);
        self.table.insert(
            own_id,
            RoutingEntry {
                seq: self.own_seq,
                hops: 0,
                magic: own_magic,
                conn: None,
                adv_connections: num_connections,
                query_countdown: 0,
            },
        );
    }

    /// Serialisable pages of the current table, hop counts raised by the
    /// cost of the link they will travel. Destinations the cost pushes
    /// past the give-up metric are advertised unreachable.
    pub fn build_pages(&self, link_cost: u8, metric_giveup: u8) -> Vec<RoutingPage> {
        let mut entries: Vec<RouteAdv> = self
            .table
            .iter()
            .map(|(dest, entry)| {
                let hops = if !entry.is_usable() {
                    HOPS_UNREACHABLE
                } else {
                    let lifted = entry.hops.saturating_add(link_cost);
                    if lifted > metric_giveup {
                        HOPS_UNREACHABLE
                    } else {
                        lifted
                    }
                };
                RouteAdv {
                    dest: *dest,
                    seq: entry.seq,
                    magic: entry.magic,
                    hops,
                    adv_connections: entry.adv_connections,
                }
            })
            .collect();
        entries.sort_by_key(|adv| adv.dest);

        if entries.is_empty() {
            return vec![RoutingPage {
                page_index: 0,
                total_pages: 1,
                sequence: self.own_seq,
                entries: Vec::new(),
            }];
        }

        let total_pages = entries.len().div_ceil(ROUTE_ENTRIES_PER_PAGE) as u8;
        entries
            .chunks(ROUTE_ENTRIES_PER_PAGE)
            .enumerate()
            .map(|(index, chunk)| RoutingPage {
                page_index: index as u8,
                total_pages,
                sequence: self.own_seq,
                entries: chunk.to_vec(),
            })
            .collect()
    }

    fn accepts(&self, dest: &PeerId, via: ConnId, seq: i32, hops: u8) -> bool {
        match self.table.get(dest) {
            None => hops < HOPS_OUTDATED_FIRST,
            Some(old) => {
                // Along the chosen next hop even worse news is installed;
                // that is how loss travels.
                if old.conn == Some(via) {
                    return true;
                }
                (seq as i64 - hops as i64) > old.goodness()
            }
        }
    }

    /// Folds one neighbor's complete advertisement into the tables. The
    /// connection's link view is rebuilt from scratch: entries the
    /// neighbor stopped advertising count as lost through it.
    pub fn apply_advertisement(
        &mut self,
        connections: &mut HashMap<ConnId, Connection>,
        via: ConnId,
        entries: Vec<RouteAdv>,
        own_id: PeerId,
    ) -> Vec<RouteEvent> {
        let mut events = Vec::new();

        let Some(conn) = connections.get_mut(&via) else {
            return events;
        };

        // Rebuild the per-link view: mark everything unreachable, then
        // overwrite with what the neighbor actually said.
        for route in conn.link_view.values_mut() {
            route.hops = HOPS_UNREACHABLE;
        }
        for adv in &entries {
            conn.link_view.insert(
                adv.dest,
                LinkRoute {
                    seq: adv.seq,
                    hops: adv.hops,
                    magic: adv.magic,
                    adv_connections: adv.adv_connections,
                },
            );
        }
        let vanished: Vec<PeerId> = conn
            .link_view
            .iter()
            .filter(|(_, route)| route.hops == HOPS_UNREACHABLE)
            .map(|(dest, _)| *dest)
            .collect();
        for dest in &vanished {
            conn.link_view.remove(dest);
        }

        // Promote advertised entries into the global table.
        for adv in entries {
            if adv.dest == own_id {
                continue;
            }
            if !self.accepts(&adv.dest, via, adv.seq, adv.hops) {
                continue;
            }

            let known = self.table.get(&adv.dest).copied();
            if let Some(previous) = known {
                if previous.magic != adv.magic && adv.hops < HOPS_OUTDATED_FIRST {
                    events.push(RouteEvent::Reborn {
                        peer: adv.dest,
                        old_magic: previous.magic,
                        new_magic: adv.magic,
                    });
                }
            } else if adv.hops < HOPS_OUTDATED_FIRST {
                events.push(RouteEvent::NewPeer(adv.dest));
            }

            if adv.hops >= HOPS_OUTDATED_FIRST {
                // Loss along the installed next hop: rescue through some
                // other link or start the countdown.
                if known.map(|entry| entry.conn == Some(via)).unwrap_or(false) {
                    self.reroute_or_outdate(connections, adv.dest, via, &mut events);
                }
                continue;
            }

            self.table.insert(
                adv.dest,
                RoutingEntry {
                    seq: adv.seq,
                    hops: adv.hops,
                    magic: adv.magic,
                    conn: Some(via),
                    adv_connections: adv.adv_connections,
                    query_countdown: 0,
                },
            );
        }

        // Destinations this neighbor dropped entirely: if our route went
        // through it, the route is gone with them.
        for dest in vanished {
            let via_this = self
                .table
                .get(&dest)
                .map(|entry| entry.conn == Some(via) && entry.is_usable())
                .unwrap_or(false);
            if via_this {
                self.reroute_or_outdate(connections, dest, via, &mut events);
            }
        }

        events
    }

    /// Picks the best surviving advertisement for `dest` over every other
    /// link, or parks the entry at the start of the outdated band.
    fn reroute_or_outdate(
        &mut self,
        connections: &HashMap<ConnId, Connection>,
        dest: PeerId,
        lost_via: ConnId,
        events: &mut Vec<RouteEvent>,
    ) {
        let survivor = connections
            .iter()
            .filter(|(id, conn)| **id != lost_via && conn.is_established())
            .filter_map(|(id, conn)| {
                conn.link_view
                    .get(&dest)
                    .filter(|route| route.hops < HOPS_OUTDATED_FIRST)
                    .map(|route| (*id, *route))
            })
            .max_by_key(|(_, route)| route.seq as i64 - route.hops as i64);

        match survivor {
            Some((via, route)) => {
                log::debug!("router: rerouting {dest} through {via} at {} hops", route.hops);
                self.table.insert(
                    dest,
                    RoutingEntry {
                        seq: route.seq,
                        hops: route.hops,
                        magic: route.magic,
                        conn: Some(via),
                        adv_connections: route.adv_connections,
                        query_countdown: 0,
                    },
                );
            }
            None => {
                if let Some(entry) = self.table.get_mut(&dest) {
                    if entry.is_usable() {
                        log::debug!("router: route to {dest} lost, starting countdown");
                        entry.hops = HOPS_OUTDATED_FIRST;
                        entry.conn = None;
                        events.push(RouteEvent::RouteLost(dest));
                    }
                }
            }
        }
    }

    /// Declares every route through a closed connection lost, rescuing
    /// what other links still advertise.
    pub fn connection_lost(
        &mut self,
        connections: &HashMap<ConnId, Connection>,
        via: ConnId,
    ) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        let through: Vec<PeerId> = self
            .table
            .iter()
            .filter(|(_, entry)| entry.conn == Some(via))
            .map(|(dest, _)| *dest)
            .collect();
        for dest in through {
            self.reroute_or_outdate(connections, dest, via, &mut events);
        }
        events
    }

    /// One aging step of the outdated band; run once per routing period.
    /// The band end is never parked: counting into it deletes the entry
    /// in the same step, so loss resolves four periods after band entry.
    pub fn age_outdated(&mut self) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        let mut dead = Vec::new();

        for (dest, entry) in self.table.iter_mut() {
            if entry.is_outdated() && entry.hops < HOPS_OUTDATED_LAST {
                entry.hops += 1;
                if entry.hops == HOPS_OUTDATED_LAST {
                    dead.push(*dest);
                }
            }
        }

        for dest in dead {
            self.table.remove(&dest);
            events.push(RouteEvent::RouteDied(dest));
        }
        events
    }

    /// Lowest reachable peer id including our own: the cluster witness.
    pub fn cluster(&self, own_id: PeerId) -> PeerId {
        self.table
            .iter()
            .filter(|(_, entry)| entry.is_usable())
            .map(|(dest, _)| *dest)
            .chain(std::iter::once(own_id))
            .min()
            .unwrap_or(own_id)
    }

    /// Purges a peer entirely (death or rebirth).
    pub fn purge(&mut self, dest: &PeerId) {
        self.table.remove(dest);
    }

    /// Counts every pending host-query backoff one period down.
    pub fn tick_query_countdowns(&mut self) {
        for entry in self.table.values_mut() {
            entry.query_countdown = entry.query_countdown.saturating_sub(1);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnId, Connection, Direction};
    use crate::iface::mem::frame_pipe;
    use mycel_core::Timestamp;

    fn adv(dest: i32, seq: i32, hops: u8) -> RouteAdv {
        RouteAdv { dest: PeerId(dest), seq, magic: Magic(0xaa), hops, adv_connections: 1 }
    }

    fn connections(ids: &[u32]) -> HashMap<ConnId, Connection> {
        let now = Timestamp::ZERO;
        ids.iter()
            .map(|&id| {
                let (ours, theirs) = frame_pipe();
                std::mem::forget(theirs);
                let mut conn =
                    Connection::new(ConnId(id), ours, Direction::Outgoing, None, 2, 8, now);
                conn.state = crate::connection::ConnState::Established;
                (ConnId(id), conn)
            })
            .collect()
    }

    #[test]
    fn routing_page_round_trips() {
        let page = RoutingPage {
            page_index: 1,
            total_pages: 3,
            sequence: 42,
            entries: vec![adv(10, 5, 2), adv(20, 7, 4)],
        };
        let bytes = page.to_bytes().expect("serialize");
        assert_eq!(bytes.len(), 7 + 2 * 14);
        assert_eq!(RoutingPage::from_bytes(&bytes).expect("deserialize"), page);
    }

    #[test]
    fn page_assembly_waits_for_every_page() {
        let mut assembly = PageAssembly::new(5, 2);
        let first = RoutingPage {
            page_index: 0,
            total_pages: 2,
            sequence: 5,
            entries: vec![adv(1, 1, 1)],
        };
        let second = RoutingPage {
            page_index: 1,
            total_pages: 2,
            sequence: 5,
            entries: vec![adv(2, 1, 1)],
        };
        assert!(assembly.ingest(first).is_none());
        let entries = assembly.ingest(second).expect("complete");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn better_goodness_replaces_a_route() {
        let mut router = Router::new();
        let mut conns = connections(&[1, 2]);

        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 4)], PeerId(1));
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(1)));

        // Worse goodness from another link is ignored.
        router.apply_advertisement(&mut conns, ConnId(2), vec![adv(30, 10, 6)], PeerId(1));
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(1)));

        // Better goodness wins.
        router.apply_advertisement(&mut conns, ConnId(2), vec![adv(30, 12, 2)], PeerId(1));
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(2)));
    }

    #[test]
    fn goodness_is_monotone_except_via_next_hop() {
        let mut router = Router::new();
        let mut conns = connections(&[1]);

        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 2)], PeerId(1));
        let before = router.entry(&PeerId(30)).expect("entry").goodness();

        // The same link may report worse news and it is believed.
        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 5)], PeerId(1));
        let after = router.entry(&PeerId(30)).expect("entry").goodness();
        assert!(after < before);
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(1)));
    }

    #[test]
    fn unreachable_via_next_hop_falls_back_to_survivor() {
        let mut router = Router::new();
        let mut conns = connections(&[1, 2]);

        router.apply_advertisement(&mut conns, ConnId(2), vec![adv(30, 9, 6)], PeerId(1));
        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 2)], PeerId(1));
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(1)));

        // Link 1 stops advertising 30; link 2's older view takes over.
        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(40, 1, 1)], PeerId(1));
        assert_eq!(router.route_for(&PeerId(30)), Some(ConnId(2)));
    }

    #[test]
    fn lost_route_ages_through_the_band_and_dies() {
        let mut router = Router::new();
        let mut conns = connections(&[1]);

        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 2)], PeerId(1));

        // Only link drops it: countdown starts.
        let events =
            router.apply_advertisement(&mut conns, ConnId(1), vec![adv(40, 1, 1)], PeerId(1));
        assert!(events.contains(&RouteEvent::RouteLost(PeerId(30))));
        assert_eq!(router.route_for(&PeerId(30)), None);
        assert!(router.entry(&PeerId(30)).expect("entry").is_outdated());

        // Three periods of counting keep the entry; the fourth kills it.
        for _ in 0..3 {
            assert!(router.age_outdated().is_empty());
            assert!(router.entry(&PeerId(30)).is_some());
        }
        let events = router.age_outdated();
        assert!(events.contains(&RouteEvent::RouteDied(PeerId(30))));
        assert!(router.entry(&PeerId(30)).is_none());
    }

    #[test]
    fn reborn_magic_is_reported() {
        let mut router = Router::new();
        let mut conns = connections(&[1]);

        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 2)], PeerId(1));
        let reborn = RouteAdv {
            dest: PeerId(30),
            seq: 1,
            magic: Magic(0xbb),
            hops: 2,
            adv_connections: 1,
        };
        let events =
            router.apply_advertisement(&mut conns, ConnId(1), vec![reborn], PeerId(1));
        assert!(events.iter().any(|event| matches!(
            event,
            RouteEvent::Reborn { peer, .. } if *peer == PeerId(30)
        )));
    }

    #[test]
    fn cluster_is_the_lowest_usable_peer() {
        let mut router = Router::new();
        let mut conns = connections(&[1]);
        router.advertise_self(PeerId(50), Magic(1), 0);
        assert_eq!(router.cluster(PeerId(50)), PeerId(50));

        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(7, 3, 2)], PeerId(50));
        assert_eq!(router.cluster(PeerId(50)), PeerId(7));
    }

    #[test]
    fn pages_lift_hops_by_link_cost_and_cap_at_giveup() {
        let mut router = Router::new();
        router.advertise_self(PeerId(1), Magic(9), 2);
        let mut conns = connections(&[1]);
        router.apply_advertisement(&mut conns, ConnId(1), vec![adv(30, 10, 9)], PeerId(1));

        let pages = router.build_pages(2, 10);
        assert_eq!(pages.len(), 1);
        let far = pages[0].entries.iter().find(|adv| adv.dest == PeerId(30)).expect("entry");
        assert_eq!(far.hops, HOPS_UNREACHABLE);
        let own = pages[0].entries.iter().find(|adv| adv.dest == PeerId(1)).expect("entry");
        assert_eq!(own.hops, 2);
    }
}
