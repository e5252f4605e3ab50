use std::time::Duration;

use serde::{Deserialize, Serialize};

use mycel_core::NetworkName;

fn default_true() -> bool {
    true
}

/// Kernel tuning. Defaults mirror the field-proven values of the protocol;
/// everything the step loop consults lives here so deployments can retune
/// without rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Overlay membership string; peers on other networks are refused.
    pub network: NetworkName,
    /// Fixed peer id, or None to draw one at boot.
    pub id: Option<i32>,
    pub hostname: String,
    pub fullname: String,

    /// Hop-count metric added per non-loopback link.
    pub metric_cost: u8,
    /// Metric at which a destination is given up as unreachable.
    pub metric_giveup: u8,

    /// Seconds between routing self-advertisements.
    pub route_broadcast_period: f64,
    /// Seconds between multicast beacons.
    pub beacon_period: f64,
    /// Seconds between connection-manager passes.
    pub connmgr_period: f64,
    /// Seconds between cluster-merge checks.
    pub cluster_check_period: f64,
    /// Seconds between time-sync rounds.
    pub timesync_period: f64,
    /// Seconds between host-info gossip rounds.
    pub hostinfo_period: f64,
    /// Seconds of silence after which a connection is closed.
    pub connection_timeout: f64,
    /// Seconds an outbound dial may stay pending.
    pub connect_timeout: f64,
    /// Seconds between re-dials of a configured auto-host.
    pub autohost_retry_period: f64,

    pub min_auto_connections: usize,
    pub max_auto_connections: usize,
    pub max_forced_auto_connections: usize,
    /// Useful bytes/s above which a direct link to a peer is forced.
    pub force_link_bps: u64,
    /// Random connections a broadcast is forwarded over.
    pub broadcast_fanout: usize,

    /// First retransmission delay for reliable sends; retry k waits k+1
    /// times this.
    pub base_retry_time: f64,
    /// Retransmissions before a reliable send fails.
    pub max_retries: u8,
    /// Process-wide ceiling on queued packages.
    pub max_allocated_packages: usize,
    /// Per-queue package cap on each connection.
    pub queue_capacity: usize,
    /// Pending acknowledgements per destination before a bundle is forced
    /// out early.
    pub max_acks_per_bundle: usize,

    /// Seconds an incomplete long message is kept.
    pub long_message_timeout: f64,
    /// Concurrent assembly buffers.
    pub max_assembly_buffers: usize,

    pub loop_ring_size: usize,
    pub loop_hash_buckets: usize,

    /// Multicast discovery group.
    pub multicast_group: String,
    pub multicast_port: u16,

    /// Accept only loopback links (leaf mode).
    pub leaf: bool,
    /// This peer answers time-sync queries authoritatively.
    pub time_master: bool,
    /// Artificial inbound drop probability for loss testing.
    pub package_loss: f64,
    /// Let the connection manager pick datagram candidates.
    pub allow_udp_links: bool,
    /// Forward broadcasts on every link instead of a random subset.
    #[serde(default = "default_true")]
    pub stochastic_broadcast: bool,
    /// Tuple indirection depth before a lookup gives up.
    pub max_meta_depth: u8,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network: NetworkName::default(),
            id: None,
            hostname: String::new(),
            fullname: String::new(),
            metric_cost: 2,
            metric_giveup: 10,
            route_broadcast_period: 10.0,
            beacon_period: 1.0,
            connmgr_period: 3.0,
            cluster_check_period: 2.0,
            timesync_period: 10.0,
            hostinfo_period: 5.0,
            connection_timeout: 30.0,
            connect_timeout: 5.0,
            autohost_retry_period: 10.0,
            min_auto_connections: 3,
            max_auto_connections: 11,
            max_forced_auto_connections: 20,
            force_link_bps: 2000,
            broadcast_fanout: 4,
            base_retry_time: 0.4,
            max_retries: 6,
            max_allocated_packages: 1024,
            queue_capacity: 64,
            max_acks_per_bundle: 100,
            long_message_timeout: 10.0,
            max_assembly_buffers: 512,
            loop_ring_size: 4096,
            loop_hash_buckets: 256,
            multicast_group: "227.1.3.5".to_string(),
            multicast_port: 10001,
            leaf: false,
            time_master: false,
            package_loss: 0.0,
            allow_udp_links: false,
            stochastic_broadcast: true,
            max_meta_depth: 8,
        }
    }
}

impl NetConfig {
    pub fn route_broadcast_period(&self) -> Duration {
        Duration::from_secs_f64(self.route_broadcast_period)
    }

    pub fn base_retry(&self) -> Duration {
        Duration::from_secs_f64(self.base_retry_time)
    }

    /// Worst-case time until a reliable send resolves:
    /// `base_retry · (1 + 2 + … + max_retries)`.
    pub fn reliable_deadline(&self) -> Duration {
        let steps: u32 = (1..=self.max_retries as u32).sum();
        Duration::from_secs_f64(self.base_retry_time * steps as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_deadline_is_triangular_in_retries() {
        let mut config = NetConfig::default();
        config.base_retry_time = 1.0;
        config.max_retries = 3;
        assert_eq!(config.reliable_deadline(), Duration::from_secs(6));
    }

    #[test]
    fn defaults_keep_auto_band_ordered() {
        let config = NetConfig::default();
        assert!(config.min_auto_connections <= config.max_auto_connections);
        assert!(config.max_auto_connections <= config.max_forced_auto_connections);
    }
}
