//! Outgoing package queues. Every queued package is drawn from one
//! process-wide pool with a hard ceiling; the four per-connection queues
//! apply random early detection before admitting load, so congestion
//! surfaces as categorised send failures instead of unbounded memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

use mycel_core::{Package, Timestamp};

use crate::error::{DeliveryStatus, NetError};

pub const MAX_ACK_CALLBACKS: usize = 3;

pub type AckFn = Box<dyn FnOnce(DeliveryStatus) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High = 0,
    PendingAck = 1,
    Normal = 2,
    Bulk = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Enqueue priority implied by a package's flag word. The pending-ack
    /// queue is never a direct enqueue target.
    pub fn of(package: &Package) -> Priority {
        if package.is_hipri() {
            Priority::High
        } else if package.is_bulk() {
            Priority::Bulk
        } else {
            Priority::Normal
        }
    }
}

struct PoolPermit {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded allocator for queued packages. The permit travels inside the
/// allocation, so releasing is automatic wherever the package ends up.
#[derive(Clone)]
pub struct PackagePool {
    outstanding: Arc<AtomicUsize>,
    ceiling: usize,
}

impl PackagePool {
    pub fn new(ceiling: usize) -> Self {
        Self { outstanding: Arc::new(AtomicUsize::new(0)), ceiling }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn allocate(
        &self,
        package: Package,
        now: Timestamp,
    ) -> Result<Box<QueuedPackage>, NetError> {
        let previous = self.outstanding.fetch_add(1, Ordering::Relaxed);
        if previous >= self.ceiling {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            return Err(NetError::PoolExhausted);
        }

        Ok(Box::new(QueuedPackage {
            package,
            enqueued: now,
            deadline: now,
            retries: 0,
            callbacks: Vec::new(),
            _permit: PoolPermit { outstanding: self.outstanding.clone() },
        }))
    }
}

pub struct QueuedPackage {
    pub package: Package,
    pub enqueued: Timestamp,
    /// Next retransmission time while parked in the pending-ack queue.
    pub deadline: Timestamp,
    pub retries: u8,
    callbacks: Vec<AckFn>,
    _permit: PoolPermit,
}

impl std::fmt::Debug for QueuedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedPackage")
            .field("package", &self.package)
            .field("enqueued", &self.enqueued)
            .field("deadline", &self.deadline)
            .field("retries", &self.retries)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl QueuedPackage {
    pub fn add_callback(&mut self, callback: AckFn) -> Result<(), NetError> {
        if self.callbacks.len() >= MAX_ACK_CALLBACKS {
            return Err(NetError::InvalidCallback);
        }
        self.callbacks.push(callback);
        Ok(())
    }

    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Consumes the package and fires every attached callback exactly once.
    pub fn resolve(mut self: Box<Self>, status: DeliveryStatus) {
        for callback in self.callbacks.drain(..) {
            callback(status);
        }
    }
}

/// Probability that one admission survives the early-detection curve at a
/// given fill rate.
pub fn red_survival(fillrate: f64) -> f64 {
    (1.0 - 2.0 * (fillrate - 0.5)).clamp(0.0, 1.0)
}

pub fn red_admit(fillrate: f64, rng: &mut SmallRng) -> bool {
    fillrate <= 0.5 || rng.gen::<f64>() < red_survival(fillrate)
}

/// The four outgoing queues of one connection: strict priority across
/// queues, FIFO within each.
pub struct QueueSet {
    queues: [VecDeque<Box<QueuedPackage>>; Priority::COUNT],
    capacity: usize,
}

impl QueueSet {
    pub fn new(capacity: usize) -> Self {
        Self { queues: Default::default(), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Occupancy of every queue at least as urgent as `priority`, against
    /// their combined capacity. This is the RED input.
    pub fn fillrate_up_to(&self, priority: Priority) -> f64 {
        let queued: usize =
            self.queues[..=priority.index()].iter().map(VecDeque::len).sum();
        let capacity = self.capacity * (priority.index() + 1);
        queued as f64 / capacity as f64
    }

    pub fn push(
        &mut self,
        priority: Priority,
        package: Box<QueuedPackage>,
    ) -> Result<(), Box<QueuedPackage>> {
        let queue = &mut self.queues[priority.index()];
        if queue.len() >= self.capacity {
            return Err(package);
        }
        queue.push_back(package);
        Ok(())
    }

    pub fn pop(&mut self, priority: Priority) -> Option<Box<QueuedPackage>> {
        self.queues[priority.index()].pop_front()
    }

    pub fn push_front(&mut self, priority: Priority, package: Box<QueuedPackage>) {
        self.queues[priority.index()].push_front(package);
    }

    /// Removes the pending-ack entry matching `ack_id`, preserving the
    /// order of everything around it.
    pub fn remove_pending(&mut self, ack_id: i32) -> Option<Box<QueuedPackage>> {
        let pending = &mut self.queues[Priority::PendingAck.index()];
        let position = pending.iter().position(|qp| qp.package.ack_id == ack_id)?;
        pending.remove(position)
    }

    /// Empties every queue; the caller owes each package a failure
    /// resolution.
    pub fn drain_all(&mut self) -> Vec<Box<QueuedPackage>> {
        let mut all = Vec::with_capacity(self.total_len());
        for queue in &mut self.queues {
            all.extend(queue.drain(..));
        }
        all
    }
}
