//! Acknowledgement batching. Acks are never sent one at a time: ids owed
//! to each peer accumulate and leave as one bundle per destination, once
//! per tick or sooner when a bundle fills up. A bundle carrying any
//! prioritised ack is itself sent reliably.

use std::collections::HashMap;

use mycel_core::{CoreError, InputBuffer, OutputBuffer, PeerId, Wire};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBundle {
    pub acks: Vec<i32>,
    pub priority: bool,
}

impl Wire for AckBundle {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        buffer.write_byte(self.priority as u8)?;
        buffer.write_u16(self.acks.len() as u16)?;
        for ack in &self.acks {
            buffer.write_i32(*ack)?;
        }
        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let priority = buffer.read_byte()? != 0;
        let count = buffer.read_u16()? as usize;
        if count * 4 > buffer.bytes_left() {
            return Err(CoreError::Malformed);
        }
        let mut acks = Vec::with_capacity(count);
        for _ in 0..count {
            acks.push(buffer.read_i32()?);
        }
        Ok(Self { acks, priority })
    }
}

pub struct AckMgr {
    pending: HashMap<PeerId, AckBundle>,
    max_per_bundle: usize,
}

impl AckMgr {
    pub fn new(max_per_bundle: usize) -> Self {
        Self { pending: HashMap::new(), max_per_bundle: max_per_bundle.max(1) }
    }

    /// Owes `destination` an ack. Returns true when its bundle just
    /// filled and should be flushed without waiting for the tick.
    pub fn schedule(&mut self, destination: PeerId, ack_id: i32, priority: bool) -> bool {
        let bundle = self
            .pending
            .entry(destination)
            .or_insert_with(|| AckBundle { acks: Vec::new(), priority: false });
        bundle.acks.push(ack_id);
        bundle.priority |= priority;
        bundle.acks.len() >= self.max_per_bundle
    }

    pub fn take_bundle(&mut self, destination: &PeerId) -> Option<AckBundle> {
        self.pending.remove(destination)
    }

    /// Drains every owed bundle; run once per ack tick.
    pub fn take_all(&mut self) -> Vec<(PeerId, AckBundle)> {
        self.pending.drain().collect()
    }

    pub fn owed(&self) -> usize {
        self.pending.values().map(|bundle| bundle.acks.len()).sum()
    }

    /// Forgets everything owed to a dead peer.
    pub fn purge(&mut self, destination: &PeerId) {
        self.pending.remove(destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_round_trips() {
        let bundle = AckBundle { acks: vec![1, 77, -3], priority: true };
        let bytes = bundle.to_bytes().expect("serialize");
        assert_eq!(AckBundle::from_bytes(&bytes).expect("deserialize"), bundle);
    }

    #[test]
    fn acks_accumulate_per_destination() {
        let mut mgr = AckMgr::new(100);
        assert!(!mgr.schedule(PeerId(5), 10, false));
        assert!(!mgr.schedule(PeerId(5), 11, true));
        assert!(!mgr.schedule(PeerId(9), 12, false));
        assert_eq!(mgr.owed(), 3);

        let bundle = mgr.take_bundle(&PeerId(5)).expect("bundle");
        assert_eq!(bundle.acks, vec![10, 11]);
        assert!(bundle.priority);

        let rest = mgr.take_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, PeerId(9));
        assert!(!rest[0].1.priority);
    }

    #[test]
    fn full_bundle_asks_for_an_early_flush() {
        let mut mgr = AckMgr::new(2);
        assert!(!mgr.schedule(PeerId(5), 1, false));
        assert!(mgr.schedule(PeerId(5), 2, false));
    }

    #[test]
    fn truncated_bundle_is_rejected() {
        let bundle = AckBundle { acks: vec![1, 2, 3], priority: false };
        let bytes = bundle.to_bytes().expect("serialize");
        assert!(AckBundle::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }
}
