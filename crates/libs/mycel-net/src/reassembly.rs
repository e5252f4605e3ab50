//! Reassembly of long messages. Fragments of one logical payload share a
//! sequence id; each carries its slot number. Buffers hold the full
//! payload contiguously and are discarded wholesale on timeout or on a
//! fragment that does not fit the declared shape.

use std::collections::HashMap;
use std::time::Duration;

use mycel_core::package::MAX_PAYLOAD;
use mycel_core::{Package, PeerId, Timestamp};

struct AssemblyBuffer {
    seq_len: u16,
    received: Vec<bool>,
    received_count: u16,
    data: Vec<u8>,
    total_len: Option<usize>,
    deadline: Timestamp,
}

pub struct Reassembly {
    buffers: HashMap<(PeerId, u16), AssemblyBuffer>,
    max_buffers: usize,
    timeout: Duration,
}

impl Reassembly {
    pub fn new(max_buffers: usize, timeout: Duration) -> Self {
        Self { buffers: HashMap::new(), max_buffers, timeout }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Feeds one fragment. Returns the whole payload once the last missing
    /// fragment arrives; a fragment violating the declared shape silently
    /// discards the message it belongs to.
    pub fn ingest(&mut self, package: &Package, now: Timestamp) -> Option<Vec<u8>> {
        let seq_len = package.seq_len as usize;
        let seq_num = package.seq_num as usize;
        if seq_len < 2 || seq_num >= seq_len {
            return None;
        }

        let is_last = seq_num == seq_len - 1;
        if !is_last && package.payload.len() != MAX_PAYLOAD {
            self.buffers.remove(&(package.source, package.seq_id));
            return None;
        }

        let key = (package.source, package.seq_id);
        if let Some(existing) = self.buffers.get(&key) {
            if existing.seq_len != package.seq_len {
                self.buffers.remove(&key);
                return None;
            }
        } else {
            if self.buffers.len() >= self.max_buffers {
                log::debug!("reassembly: buffer limit reached, dropping long message");
                return None;
            }
            self.buffers.insert(
                key,
                AssemblyBuffer {
                    seq_len: package.seq_len,
                    received: vec![false; seq_len],
                    received_count: 0,
                    data: vec![0u8; seq_len * MAX_PAYLOAD],
                    total_len: None,
                    deadline: now + self.timeout,
                },
            );
        }
        let buffer = self.buffers.get_mut(&key)?;

        if !buffer.received[seq_num] {
            buffer.received[seq_num] = true;
            buffer.received_count += 1;
            let at = seq_num * MAX_PAYLOAD;
            buffer.data[at..at + package.payload.len()].copy_from_slice(&package.payload);
            if is_last {
                buffer.total_len = Some((seq_len - 1) * MAX_PAYLOAD + package.payload.len());
            }
        }

        if buffer.received_count as usize == seq_len {
            let buffer = self.buffers.remove(&key)?;
            let total = buffer.total_len?;
            let mut data = buffer.data;
            data.truncate(total);
            return Some(data);
        }

        None
    }

    /// Drops buffers whose window has passed. Nothing is delivered for an
    /// expired message.
    pub fn expire(&mut self, now: Timestamp) {
        self.buffers.retain(|(source, seq_id), buffer| {
            let keep = buffer.deadline > now;
            if !keep {
                log::debug!(
                    "reassembly: long message {}:{} timed out with {}/{} fragments",
                    source,
                    seq_id,
                    buffer.received_count,
                    buffer.seq_len
                );
            }
            keep
        });
    }

    /// Drops every buffer originating at `source`, used when the peer dies.
    pub fn purge_source(&mut self, source: PeerId) {
        self.buffers.retain(|(from, _), _| *from != source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycel_core::PackageType;

    fn fragment(source: i32, seq_id: u16, seq_len: u16, seq_num: u16, payload: Vec<u8>) -> Package {
        let mut package = Package::new(PackageType::Directed, PeerId(source), PeerId(99));
        package.seq_id = seq_id;
        package.seq_len = seq_len;
        package.seq_num = seq_num;
        package.payload = payload;
        package
    }

    fn split(data: &[u8]) -> Vec<Vec<u8>> {
        data.chunks(MAX_PAYLOAD).map(|chunk| chunk.to_vec()).collect()
    }

    #[test]
    fn fragments_reassemble_in_any_order() {
        let data: Vec<u8> = (0..(2 * MAX_PAYLOAD + 100)).map(|i| (i % 251) as u8).collect();
        let chunks = split(&data);
        assert_eq!(chunks.len(), 3);

        let mut reassembly = Reassembly::new(8, Duration::from_secs(10));
        let now = Timestamp::ZERO;

        assert!(reassembly.ingest(&fragment(1, 7, 3, 2, chunks[2].clone()), now).is_none());
        assert!(reassembly.ingest(&fragment(1, 7, 3, 0, chunks[0].clone()), now).is_none());
        let whole = reassembly
            .ingest(&fragment(1, 7, 3, 1, chunks[1].clone()), now)
            .expect("complete message");

        assert_eq!(whole, data);
        assert_eq!(reassembly.buffer_count(), 0);
    }

    #[test]
    fn duplicate_fragments_are_harmless() {
        let data = vec![9u8; MAX_PAYLOAD + 1];
        let chunks = split(&data);

        let mut reassembly = Reassembly::new(8, Duration::from_secs(10));
        let now = Timestamp::ZERO;

        assert!(reassembly.ingest(&fragment(1, 3, 2, 0, chunks[0].clone()), now).is_none());
        assert!(reassembly.ingest(&fragment(1, 3, 2, 0, chunks[0].clone()), now).is_none());
        let whole =
            reassembly.ingest(&fragment(1, 3, 2, 1, chunks[1].clone()), now).expect("complete");
        assert_eq!(whole, data);
    }

    #[test]
    fn expiry_discards_incomplete_messages() {
        let mut reassembly = Reassembly::new(8, Duration::from_secs(10));
        let start = Timestamp::ZERO;
        reassembly.ingest(&fragment(1, 3, 2, 0, vec![0u8; MAX_PAYLOAD]), start);
        assert_eq!(reassembly.buffer_count(), 1);

        reassembly.expire(start + Duration::from_secs(11));
        assert_eq!(reassembly.buffer_count(), 0);

        // The late last fragment opens a fresh, incomplete buffer.
        assert!(reassembly.ingest(&fragment(1, 3, 2, 1, vec![1u8; 10]), start).is_none());
    }

    #[test]
    fn short_middle_fragment_poisons_the_message() {
        let mut reassembly = Reassembly::new(8, Duration::from_secs(10));
        let now = Timestamp::ZERO;
        reassembly.ingest(&fragment(1, 3, 3, 0, vec![0u8; MAX_PAYLOAD]), now);
        assert!(reassembly.ingest(&fragment(1, 3, 3, 1, vec![0u8; 5]), now).is_none());
        assert_eq!(reassembly.buffer_count(), 0);
    }

    #[test]
    fn buffer_limit_rejects_new_messages_only() {
        let mut reassembly = Reassembly::new(1, Duration::from_secs(10));
        let now = Timestamp::ZERO;
        reassembly.ingest(&fragment(1, 1, 2, 0, vec![0u8; MAX_PAYLOAD]), now);
        // Second message cannot open a buffer...
        assert!(reassembly.ingest(&fragment(2, 2, 2, 0, vec![0u8; MAX_PAYLOAD]), now).is_none());
        assert_eq!(reassembly.buffer_count(), 1);
        // ...but the first still completes.
        assert!(reassembly.ingest(&fragment(1, 1, 2, 1, vec![1u8; 4]), now).is_some());
    }
}
