//! Per-link state. A connection isolates one peer link: its frame link,
//! greeting progress, outgoing queues, retry store, traffic counters and
//! the routing view its neighbor last advertised.

use core::fmt;
use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::Rng;

use mycel_core::{
    InputBuffer, Magic, NetworkName, OutputBuffer, Package, PeerId, Timestamp, Wire,
};
use mycel_core::{package, CoreError, LinkUrl};

use crate::error::DeliveryStatus;
use crate::iface::{FrameEvent, FrameLink, SendOutcome};
use crate::queue::{Priority, QueueSet, QueuedPackage};
use crate::router::{LinkRoute, PageAssembly};

pub const PROTOCOL_VERSION: u32 = 1;

/// Flags carried in the link greeting.
pub mod connect_flags {
    pub const FORCE_BCAST: u32 = 1 << 0;
    pub const FORCED_BW: u32 = 1 << 1;
    pub const FORCED_CL: u32 = 1 << 2;
}

/// First frame in each direction of a fresh link: protocol version, link
/// flags, the sender's id and its overlay membership string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: u32,
    pub flags: u32,
    pub id: PeerId,
    pub network: NetworkName,
}

impl Greeting {
    pub fn new(id: PeerId, network: NetworkName, flags: u32) -> Self {
        Self { version: PROTOCOL_VERSION, flags, id, network }
    }
}

impl Wire for Greeting {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        buffer.write_u32(self.version)?;
        buffer.write_u32(self.flags)?;
        self.id.serialize(buffer)?;
        self.network.serialize(buffer)?;
        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let version = buffer.read_u32()?;
        let flags = buffer.read_u32()?;
        let id = PeerId::deserialize(buffer)?;
        let network = NetworkName::deserialize(buffer)?;
        Ok(Self { version, flags, id, network })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A link whose routing value cannot be beaten: too young to judge, not
/// yet resolved, or carrying forced traffic.
pub const VALUE_INFINITE: i64 = i64::MAX;

pub struct Connection {
    pub id: ConnId,
    link: FrameLink,
    pub state: ConnState,
    pub direction: Direction,
    pub peer: Option<PeerId>,
    pub peer_magic: Option<Magic>,
    pub url: Option<LinkUrl>,
    pub cost: u8,
    pub value: i64,
    pub created: Timestamp,
    pub last_activity: Timestamp,
    pub greeting_sent: bool,
    pub greeting_received: bool,
    pub force_broadcast: bool,
    pub forced_bw: bool,
    pub forced_cl: bool,

    queues: QueueSet,
    out_link_seq: u32,
    in_link_seq: Option<u32>,
    pub in_frames: u64,
    pub in_lost: u64,

    pub bytes_in: u64,
    pub bytes_out: u64,
    pub useful_in: u64,
    pub useful_out: u64,
    rate_window_start: Timestamp,
    rate_useful: u64,

    /// Last full routing table this neighbor advertised, one entry per
    /// destination it claimed to reach.
    pub link_view: HashMap<PeerId, LinkRoute>,
    /// Partially received routing advertisement, per advertisement round.
    pub route_pages: Option<PageAssembly>,
}

impl Connection {
    pub fn new(
        id: ConnId,
        link: FrameLink,
        direction: Direction,
        url: Option<LinkUrl>,
        cost: u8,
        queue_capacity: usize,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            link,
            state: ConnState::Pending,
            direction,
            peer: None,
            peer_magic: None,
            url,
            cost,
            value: VALUE_INFINITE,
            created: now,
            last_activity: now,
            greeting_sent: false,
            greeting_received: false,
            force_broadcast: false,
            forced_bw: false,
            forced_cl: false,
            queues: QueueSet::new(queue_capacity),
            out_link_seq: 0,
            in_link_seq: None,
            in_frames: 0,
            in_lost: 0,
            bytes_in: 0,
            bytes_out: 0,
            useful_in: 0,
            useful_out: 0,
            rate_window_start: now,
            rate_useful: 0,
            link_view: HashMap::new(),
            route_pages: None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.link.is_loopback()
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    /// Greeting frames bypass the queues: they must be first on the wire.
    pub fn send_greeting(&mut self, greeting: &Greeting) -> bool {
        let Ok(bytes) = greeting.to_bytes() else {
            return false;
        };
        match self.link.send_frame(bytes) {
            SendOutcome::Sent => {
                self.greeting_sent = true;
                true
            }
            SendOutcome::WouldBlock => false,
            SendOutcome::PipeBroken => false,
        }
    }

    /// Admits a package to the queue implied by its flags, applying the
    /// early-detection curve first. On failure the package comes back with
    /// the status the caller owes its callbacks.
    pub fn enqueue(
        &mut self,
        package: Box<QueuedPackage>,
        rng: &mut SmallRng,
    ) -> Result<(), (Box<QueuedPackage>, DeliveryStatus)> {
        let priority = Priority::of(&package.package);

        let fillrate = self.queues.fillrate_up_to(priority);
        if !crate::queue::red_admit(fillrate, rng) {
            log::debug!("{}: early drop at fillrate {:.2}", self.id, fillrate);
            return Err((package, DeliveryStatus::RedDrop));
        }

        self.queues.push(priority, package).map_err(|package| (package, DeliveryStatus::QueueFull))
    }

    pub fn queued(&self) -> usize {
        self.queues.total_len()
    }

    pub fn pending_acks(&self) -> usize {
        self.queues.len(Priority::PendingAck)
    }

    /// Removes the retry-store entry matching an acknowledgement id.
    pub fn take_pending(&mut self, ack_id: i32) -> Option<Box<QueuedPackage>> {
        self.queues.remove_pending(ack_id)
    }

    fn send_package(&mut self, package: &mut Package) -> SendOutcome {
        package.link_cnt = self.out_link_seq;

        let mut raw = vec![0u8; package::HEADER_LEN + package::MAX_PAYLOAD];
        let mut out = OutputBuffer::new(&mut raw);
        let len = match package.serialize(&mut out) {
            Ok(len) => len,
            Err(_) => return SendOutcome::PipeBroken,
        };
        raw.truncate(len);

        let outcome = self.link.send_frame(raw);
        if outcome == SendOutcome::Sent {
            self.out_link_seq = self.out_link_seq.wrapping_add(1);
            self.bytes_out += len as u64;
            if package.port > package::port::HIGHEST_META {
                self.useful_out += len as u64;
                self.rate_useful += len as u64;
            }
        }
        outcome
    }

    /// Walks the queues in strict priority order and pushes what the link
    /// accepts. The pending-ack queue acts as the retry store: due entries
    /// are retransmitted with a lengthening deadline, exhausted ones fail.
    /// Returns false when the link is gone and the connection must close.
    pub fn drain(
        &mut self,
        now: Timestamp,
        own_id: PeerId,
        base_retry: Duration,
        max_retries: u8,
        rng: &mut SmallRng,
    ) -> bool {
        for priority in
            [Priority::High, Priority::PendingAck, Priority::Normal, Priority::Bulk]
        {
            if priority == Priority::PendingAck {
                if !self.drain_pending(now, base_retry, max_retries, rng) {
                    return false;
                }
                continue;
            }

            loop {
                let Some(mut queued) = self.queues.pop(priority) else { break };

                match self.send_package(&mut queued.package) {
                    SendOutcome::Sent => {
                        let reliable = queued.package.wants_ack()
                            && queued.package.source == own_id;
                        if reliable {
                            // Fresh id per transmission so duplicate
                            // suppression does not swallow the retry.
                            queued.package.id = draw_package_id(rng);
                            queued.retries = 0;
                            queued.deadline = now + base_retry;
                            if let Err(failed) = self.queues.push(Priority::PendingAck, queued) {
                                log::debug!("{}: retry store full", self.id);
                                failed.resolve(DeliveryStatus::QueueFull);
                            }
                        } else if queued.has_callbacks() {
                            queued.resolve(DeliveryStatus::Acked);
                        }
                    }
                    SendOutcome::WouldBlock => {
                        self.queues.push_front(priority, queued);
                        break;
                    }
                    SendOutcome::PipeBroken => {
                        self.queues.push_front(priority, queued);
                        return false;
                    }
                }
            }
        }
        true
    }

    fn drain_pending(
        &mut self,
        now: Timestamp,
        base_retry: Duration,
        max_retries: u8,
        rng: &mut SmallRng,
    ) -> bool {
        let parked = self.queues.len(Priority::PendingAck);
        for _ in 0..parked {
            let Some(mut queued) = self.queues.pop(Priority::PendingAck) else { break };

            if queued.deadline > now {
                // Not due; rotate to the back and keep walking.
                let _ = self.queues.push(Priority::PendingAck, queued);
                continue;
            }

            // Transmissions so far: the initial send plus `retries`
            // repeats. The budget covers `max_retries` transmissions, so
            // the deadline lands at base · (1 + 2 + … + max_retries).
            if queued.retries + 1 >= max_retries {
                log::debug!(
                    "{}: giving up on ack {} after {} transmissions",
                    self.id,
                    queued.package.ack_id,
                    queued.retries + 1
                );
                queued.resolve(DeliveryStatus::RetriesExhausted);
                continue;
            }

            // Fresh id per transmission: duplicate suppression at the
            // receiver must not swallow the retry. The ack id stays, it
            // is what the acknowledgement will match on.
            queued.package.id = draw_package_id(rng);
            match self.send_package(&mut queued.package) {
                SendOutcome::Sent => {
                    queued.retries += 1;
                    let backoff = base_retry.mul_f64((queued.retries + 1) as f64);
                    queued.deadline = now + backoff;
                    let _ = self.queues.push(Priority::PendingAck, queued);
                }
                SendOutcome::WouldBlock => {
                    let _ = self.queues.push(Priority::PendingAck, queued);
                    break;
                }
                SendOutcome::PipeBroken => {
                    let _ = self.queues.push(Priority::PendingAck, queued);
                    return false;
                }
            }
        }
        true
    }

    /// Pulls buffered frames off the link. The boolean is false when the
    /// transport pipe is gone.
    pub fn poll_frames(&mut self, budget: usize) -> (Vec<Vec<u8>>, bool) {
        let mut frames = Vec::new();
        for _ in 0..budget {
            match self.link.recv_frame() {
                FrameEvent::Frame(frame) => frames.push(frame),
                FrameEvent::Empty => break,
                FrameEvent::PipeBroken => return (frames, false),
            }
        }
        (frames, true)
    }

    /// Bookkeeping for one received package: activity, traffic counters
    /// and link-loss estimation from the link-layer counter.
    pub fn note_received(&mut self, package: &Package, wire_len: usize, now: Timestamp) {
        self.last_activity = now;
        self.bytes_in += wire_len as u64;
        if package.port > package::port::HIGHEST_META {
            self.useful_in += wire_len as u64;
            self.rate_useful += wire_len as u64;
        }

        self.in_frames += 1;
        if let Some(previous) = self.in_link_seq {
            let gap = package.link_cnt.wrapping_sub(previous);
            if gap > 1 && gap < u32::MAX / 2 {
                self.in_lost += (gap - 1) as u64;
            }
        }
        self.in_link_seq = Some(package.link_cnt);
    }

    /// Estimated fraction of link-layer frames lost inbound.
    pub fn loss_estimate(&self) -> f64 {
        let total = self.in_frames + self.in_lost;
        if total == 0 {
            return 0.0;
        }
        self.in_lost as f64 / total as f64
    }

    /// Useful-byte rate since the last window reset.
    pub fn useful_rate(&self, now: Timestamp) -> f64 {
        let elapsed = (now - self.rate_window_start) as f64 / 1e6;
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.rate_useful as f64 / elapsed
    }

    pub fn reset_rate_window(&mut self, now: Timestamp) {
        self.rate_window_start = now;
        self.rate_useful = 0;
    }

    /// Shifts every internal timestamp, used when the wall clock jumps.
    pub fn shift_time(&mut self, delta_micros: i64) {
        self.created = self.created.shift_micros(delta_micros);
        self.last_activity = self.last_activity.shift_micros(delta_micros);
        self.rate_window_start = self.rate_window_start.shift_micros(delta_micros);
    }

    /// Tears the link down and fails everything still queued. Idempotent:
    /// the queues only drain once.
    pub fn close(&mut self) {
        self.link.shutdown();
        for queued in self.queues.drain_all() {
            queued.resolve(DeliveryStatus::ConnectionClosed);
        }
    }
}

pub fn draw_package_id(rng: &mut SmallRng) -> i32 {
    rng.gen_range(1..=i32::MAX)
}
