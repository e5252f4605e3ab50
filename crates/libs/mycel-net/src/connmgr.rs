//! Connection management. Keeps the direct-link count inside the
//! configured band, closes idle and duplicate links, scores every link by
//! how much the overlay would suffer without it, and dials the candidate
//! that would improve routing the most. Runs as one periodic pass; at
//! most one outbound dial leaves per pass to damp oscillation.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use mycel_core::hostinfo::AddrFamily;
use mycel_core::{HostInfo, LinkUrl, PeerId};

use crate::connection::{ConnId, ConnState, VALUE_INFINITE};
use crate::kernel::KernelCore;
use crate::router::HOPS_OUTDATED_FIRST;

/// Links younger than this are not judged yet.
const MIN_LINK_AGE: Duration = Duration::from_secs(10);

/// Chance per pass of closing one end of a duplicate pair; both ends
/// racing to close simultaneously would otherwise flap.
const DUPLICATE_CLOSE_PROBABILITY: f64 = 0.3;

impl KernelCore {
    /// One management pass over every link.
    pub fn connmgr_tick(&mut self) {
        self.close_timed_out();
        self.close_duplicates();
        self.recompute_values();
        self.force_links();
        self.schedule_links();
        self.peer_traffic.clear();
    }

    /// Heavy traffic to an indirect peer earns it a direct link, allowed
    /// to overshoot the normal budget up to the forced maximum.
    fn force_links(&mut self) {
        if self.config.leaf {
            return;
        }
        if self.connections.len() >= self.config.max_forced_auto_connections {
            return;
        }

        let threshold =
            (self.config.force_link_bps as f64 * self.config.connmgr_period) as u64;
        let heavy: Vec<PeerId> = self
            .peer_traffic
            .iter()
            .filter(|(peer, bytes)| {
                **bytes > threshold && self.connections_to(**peer).is_empty()
            })
            .map(|(peer, _)| *peer)
            .collect();

        for peer in heavy {
            let Some(info) = self.hosts.get(&peer).cloned() else { continue };
            let Some(url) = self.best_dial_url(&info) else { continue };
            if self.has_dial_to(&url) {
                continue;
            }
            log::info!("connmgr: traffic forces a direct link to {peer}");
            let _ = self.dial(url, None);
            break; // one forced dial per pass
        }
    }

    fn close_timed_out(&mut self) {
        let now = self.clock.now();
        let idle_limit = Duration::from_secs_f64(self.config.connection_timeout);
        let pending_limit = Duration::from_secs_f64(self.config.connect_timeout);

        let stale: Vec<(ConnId, &'static str)> = self
            .connections
            .iter()
            .filter_map(|(id, conn)| {
                if conn.state == ConnState::Pending {
                    (now - conn.created > pending_limit.as_micros() as i64)
                        .then_some((*id, "greeting timed out"))
                } else {
                    (now - conn.last_activity > idle_limit.as_micros() as i64)
                        .then_some((*id, "idle timeout"))
                }
            })
            .collect();

        for (id, reason) in stale {
            self.close_connection(id, reason);
        }
    }

    /// Two live links to the same peer waste a slot. One goes, preferring
    /// the pending or quieter one, and only sometimes per pass so both
    /// ends do not close in the same breath.
    fn close_duplicates(&mut self) {
        let mut by_peer: HashMap<PeerId, Vec<ConnId>> = HashMap::new();
        for (id, conn) in &self.connections {
            if let Some(peer) = conn.peer {
                by_peer.entry(peer).or_default().push(*id);
            }
        }

        let mut victims = Vec::new();
        for (_, mut ids) in by_peer {
            while ids.len() > 1 {
                if self.rng.gen::<f64>() >= DUPLICATE_CLOSE_PROBABILITY {
                    break;
                }
                ids.sort_by_key(|id| {
                    let conn = &self.connections[id];
                    // Pending first, then least received traffic.
                    (conn.state == ConnState::Established, conn.bytes_in)
                });
                victims.push(ids.remove(0));
            }
        }

        for id in victims {
            self.close_connection(id, "duplicate link");
        }
    }

    /// A link's value is how much worse the route to its peer would get
    /// without it. Young, unresolved or traffic-forced links are beyond
    /// judgement and never closed for optimisation.
    fn recompute_values(&mut self) {
        let now = self.clock.now();
        let force_bps = self.config.force_link_bps as f64;
        let worst_hops = self.config.metric_giveup;

        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            let (peer, age_micros, rate, cost) = {
                let conn = &self.connections[&id];
                (conn.peer, now - conn.created, conn.useful_rate(now), conn.cost)
            };

            let value = match peer {
                None => VALUE_INFINITE,
                Some(_) if age_micros < MIN_LINK_AGE.as_micros() as i64 => VALUE_INFINITE,
                Some(_) if rate > force_bps => VALUE_INFINITE,
                Some(peer) => {
                    let best_alternative = self
                        .connections
                        .iter()
                        .filter(|(other, conn)| **other != id && conn.is_established())
                        .filter_map(|(_, conn)| conn.link_view.get(&peer))
                        .filter(|route| route.hops < HOPS_OUTDATED_FIRST)
                        .map(|route| route.hops)
                        .min()
                        .unwrap_or(worst_hops);
                    (best_alternative as i64 - cost as i64) * 100
                        + self.rng.gen_range(0..100)
                }
            };

            if let Some(conn) = self.connections.get_mut(&id) {
                conn.value = value;
                conn.reset_rate_window(now);
            }
        }
    }

    fn schedule_links(&mut self) {
        if self.config.leaf {
            return;
        }

        let open = self.connections.len();
        let min_auto = self.config.min_auto_connections;
        let max_auto = self.config.max_auto_connections;

        let candidate = self.best_candidate();
        let worst = self.worst_link();

        if open < min_auto {
            if let Some((peer, url, _)) = candidate {
                log::debug!("connmgr: below minimum, dialling {peer} at {url}");
                let _ = self.dial(url, None);
            }
            return;
        }

        if open + 1 < max_auto.saturating_sub(1) {
            if let Some((peer, url, value)) = candidate {
                let beats_worst = worst.map(|(_, worst_value)| value > worst_value).unwrap_or(true);
                if beats_worst {
                    log::debug!("connmgr: upgrading overlay with link to {peer} ({value})");
                    if open + 1 > max_auto {
                        if let Some((worst_id, _)) = worst {
                            self.close_connection(worst_id, "making room");
                        }
                    }
                    let _ = self.dial(url, None);
                }
            }
            return;
        }

        if open > max_auto {
            if let Some((worst_id, worst_value)) = worst {
                if worst_value < VALUE_INFINITE {
                    log::debug!("connmgr: over maximum, closing {worst_id}");
                    self.close_connection(worst_id, "over connection budget");
                }
            }
        }
    }

    fn worst_link(&self) -> Option<(ConnId, i64)> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_established() && conn.value < VALUE_INFINITE)
            .map(|(id, conn)| (*id, conn.value))
            .min_by_key(|(_, value)| *value)
    }

    /// Best peer to open a new link to: biggest routing gain, discounted
    /// by how well-connected the peer already is.
    fn best_candidate(&mut self) -> Option<(PeerId, LinkUrl, i64)> {
        let own_id = self.own_id;
        let worst_hops = self.config.metric_giveup;
        let metric_cost = self.config.metric_cost;

        let mut best: Option<(PeerId, LinkUrl, i64)> = None;
        let infos: Vec<(PeerId, HostInfo)> =
            self.hosts.iter().map(|(id, info)| (*id, info.clone())).collect();

        for (peer, info) in infos {
            if peer == own_id || !self.connections_to(peer).is_empty() {
                continue;
            }
            let Some(url) = self.best_dial_url(&info) else { continue };
            if self.has_dial_to(&url) {
                continue;
            }

            let (current_hops, adv_connections) = match self.router.entry(&peer) {
                Some(entry) if entry.is_usable() => (entry.hops, entry.adv_connections),
                _ => (worst_hops, 0),
            };
            let estimated_cost =
                if info.has_loopback_only() { 1 } else { metric_cost };

            let value = (current_hops as i64 - estimated_cost as i64) * 100
                - adv_connections as i64 * 20
                + self.rng.gen_range(0..100);

            if best.as_ref().map(|(_, _, best_value)| value > *best_value).unwrap_or(true) {
                best = Some((peer, url, value));
            }
        }
        best
    }

    /// First advertised address a local driver believes it can reach.
    fn best_dial_url(&self, info: &HostInfo) -> Option<LinkUrl> {
        for address in &info.addresses {
            if address.family == AddrFamily::Datagram && !self.config.allow_udp_links {
                continue;
            }
            if address.family == AddrFamily::L2cap {
                continue; // no driver for it here
            }
            let Some(url) = LinkUrl::from_lowlevel(address) else { continue };
            let family = url.family();
            let reachable = self
                .drivers_iter()
                .any(|driver| driver.family() == family && driver.is_reachable(&url));
            if reachable {
                return Some(url);
            }
        }
        None
    }

    /// Cluster merge: a known peer whose beacon names a different cluster
    /// witness proves a partition; one dial stitches the overlays back.
    pub fn cluster_tick(&mut self) {
        if self.config.leaf {
            return;
        }
        let ours = self.cluster;

        let split: Vec<(PeerId, HostInfo)> = self
            .hosts
            .iter()
            .filter(|(peer, info)| {
                info.network_cluster != ours && self.connections_to(**peer).is_empty()
            })
            .map(|(peer, info)| (*peer, info.clone()))
            .collect();

        for (peer, info) in split {
            if let Some(url) = self.best_dial_url(&info) {
                log::info!(
                    "connmgr: cluster {} seen at {peer}, dialling to merge",
                    info.network_cluster
                );
                let _ = self.dial(url, None);
                break; // one merge attempt per pass
            }
        }
    }
}
