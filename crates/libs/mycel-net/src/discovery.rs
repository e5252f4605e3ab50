//! Peer discovery. The kernel beacons its own host record onto the
//! multicast segment every period; received beacons seed the host store
//! without any central registry. Host records also travel the overlay as
//! gossip (port 13) so peers beyond multicast reach learn names and
//! addresses too.

use mycel_core::package::port;
use mycel_core::{HostInfo, InputBuffer, OutputBuffer, PackageFlags, Wire};

use crate::connection::PROTOCOL_VERSION;
use crate::error::DeadHostReason;
use crate::kernel::KernelCore;

/// Beacons drained per step; discovery is chatty but never urgent.
const BEACONS_PER_STEP: usize = 16;

impl KernelCore {
    /// Sends one discovery beacon: protocol version, network string and
    /// our current host record.
    pub fn beacon_tick(&mut self) {
        let info = self.my_hostinfo();
        let Some(beacon) = &self.beacon else { return };

        let mut raw = vec![0u8; 2048];
        let mut out = OutputBuffer::new(&mut raw);
        let written = (|| {
            out.write_u32(PROTOCOL_VERSION)?;
            self.config.network.serialize(&mut out)?;
            info.serialize(&mut out)
        })();

        match written {
            Ok(len) => {
                raw.truncate(len);
                beacon.broadcast_beacon(raw);
            }
            Err(err) => log::warn!("discovery: beacon serialisation failed: {err}"),
        }
    }

    pub(crate) fn pump_beacons(&mut self) {
        for _ in 0..BEACONS_PER_STEP {
            let Some(bytes) = self.beacon.as_mut().and_then(|beacon| beacon.recv_beacon())
            else {
                break;
            };
            self.ingest_beacon(&bytes);
        }
    }

    fn ingest_beacon(&mut self, bytes: &[u8]) {
        let mut input = InputBuffer::new(bytes);

        let Ok(version) = input.read_u32() else { return };
        if version != PROTOCOL_VERSION {
            return;
        }
        let Ok(network) = mycel_core::NetworkName::deserialize(&mut input) else { return };
        if network != self.config.network {
            return;
        }
        let Ok(info) = HostInfo::deserialize(&mut input) else {
            log::debug!("discovery: malformed beacon host record");
            return;
        };

        self.ingest_hostinfo(info);
    }

    /// Folds a received host record into the store. A known id arriving
    /// with a different magic is a new incarnation: the old one's state
    /// is purged first.
    pub fn ingest_hostinfo(&mut self, mut info: HostInfo) {
        if info.id == self.own_id || !info.id.is_valid() {
            return;
        }

        if let Some(existing) = self.hosts.get(&info.id) {
            if existing.magic != info.magic {
                log::info!(
                    "discovery: peer {} reincarnated ({} -> {})",
                    info.id,
                    existing.magic,
                    info.magic
                );
                self.declare_dead(info.id, DeadHostReason::Reborn);
                // Unlike an advertisement-detected rebirth, no entry for
                // the new incarnation exists yet; the old one's high
                // sequence number would shadow the restarted peer's low
                // ones until it aged out.
                self.router.purge(&info.id);
            }
        } else {
            log::info!("discovery: found peer {} ({})", info.id, info.hostname);
        }

        info.last_seen = self.clock.now();
        for conn in self.connections.values_mut() {
            if conn.peer == Some(info.id) {
                conn.peer_magic = Some(info.magic);
            }
        }
        self.hosts.insert(info.id, info);
    }

    /// Gossips our host record across the overlay, reaching peers the
    /// multicast segment cannot.
    pub fn hostinfo_tick(&mut self) {
        let mut info = self.my_hostinfo();
        info.is_cached = true;
        match info.to_bytes() {
            Ok(payload) => {
                let _ = self.broadcast(port::HOSTINFO, payload, PackageFlags::default());
            }
            Err(err) => log::warn!("discovery: host record serialisation failed: {err}"),
        }
    }
}
