//! The local tuple store: every tuple this peer owns or has received,
//! the value callbacks registered on it, and both sides of the
//! subscription relation (who we feed, what we asked others for).

use std::collections::HashMap;

use mycel_core::{PeerId, Timestamp};

use crate::error::TupleError;
use crate::tuple::{key_matches, validate_key, Tuple};

pub type TupleCallback = Box<dyn FnMut(&Tuple) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

struct CallbackReg {
    handle: CallbackHandle,
    /// BROADCAST matches tuples of any owner.
    owner: PeerId,
    pattern: String,
    hook: TupleCallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SubscriberReg {
    subscriber: PeerId,
    owner: PeerId,
    pattern: String,
}

#[derive(Debug, Clone)]
pub struct OurSubscription {
    pub handle: SubscriptionHandle,
    pub owner: PeerId,
    pub pattern: String,
}

pub struct TupleSpace {
    own_id: PeerId,
    tuples: HashMap<(PeerId, String), Tuple>,
    callbacks: Vec<CallbackReg>,
    subscribers: Vec<SubscriberReg>,
    our_subs: Vec<OurSubscription>,
    next_handle: u64,
    next_seq: u32,
}

impl TupleSpace {
    pub fn new(own_id: PeerId) -> Self {
        Self {
            own_id,
            tuples: HashMap::new(),
            callbacks: Vec::new(),
            subscribers: Vec::new(),
            our_subs: Vec::new(),
            next_handle: 0,
            next_seq: 0,
        }
    }

    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Accepts a tuple if it is newer than what we hold (owner version
    /// counter first, write stamp as the tie-breaker) and fires matching
    /// callbacks. Returns whether the value was taken.
    pub fn insert(&mut self, tuple: Tuple) -> bool {
        let key = (tuple.owner, tuple.key.clone());
        if let Some(existing) = self.tuples.get(&key) {
            let newer = tuple.seq > existing.seq
                || (tuple.seq == existing.seq && tuple.ts_write > existing.ts_write);
            if !newer {
                return false;
            }
        }

        self.tuples.insert(key, tuple.clone());
        self.fire_callbacks(&tuple);
        true
    }

    fn fire_callbacks(&mut self, tuple: &Tuple) {
        for reg in &mut self.callbacks {
            let owner_matches = reg.owner.is_broadcast() || reg.owner == tuple.owner;
            if owner_matches && key_matches(&reg.pattern, &tuple.key) {
                (reg.hook)(tuple);
            }
        }
    }

    /// Writes a tuple we own. The write stamp is the caller's network
    /// clock; the version counter is ours alone.
    pub fn local_set(&mut self, mut tuple: Tuple, now: Timestamp) -> Result<Tuple, TupleError> {
        validate_key(&tuple.key)?;
        tuple.owner = self.own_id;
        tuple.ts_write = now;
        self.next_seq += 1;
        tuple.seq = self.next_seq;
        self.insert(tuple.clone());
        Ok(tuple)
    }

    /// Appends to a tuple we own, creating it when missing. Only the
    /// owner appends, always under its own timestamp, so every subscriber
    /// sees the same concatenation order.
    pub fn local_append(
        &mut self,
        key: &str,
        suffix: &[u8],
        now: Timestamp,
    ) -> Result<Tuple, TupleError> {
        validate_key(key)?;

        let mut tuple = self
            .tuples
            .get(&(self.own_id, key.to_string()))
            .cloned()
            .unwrap_or_else(|| Tuple::new(self.own_id, key, Vec::new()));

        tuple.data.extend_from_slice(suffix);
        tuple.ts_write = now;
        self.next_seq += 1;
        tuple.seq = self.next_seq;

        self.tuples.insert((self.own_id, key.to_string()), tuple.clone());
        self.fire_callbacks(&tuple);
        Ok(tuple)
    }

    /// Reads a tuple, following metatuple indirection up to `max_depth`
    /// links. Expired tuples read as absent.
    pub fn get(
        &self,
        owner: PeerId,
        key: &str,
        now: Timestamp,
        max_depth: u8,
    ) -> Result<Tuple, TupleError> {
        let mut owner = owner;
        let mut key = key.to_string();

        for _ in 0..=max_depth {
            let tuple =
                self.tuples.get(&(owner, key.clone())).ok_or(TupleError::NotFound)?;
            if tuple.is_expired(now) {
                return Err(TupleError::NotFound);
            }
            if !tuple.is_meta() {
                return Ok(tuple.clone());
            }
            let (next_owner, next_key) = tuple.meta_target()?;
            owner = next_owner;
            key = next_key;
        }
        Err(TupleError::MetaDepth)
    }

    /// Every stored tuple of `owner` matching `pattern` (expired ones
    /// excluded).
    pub fn matching_tuples(&self, owner: PeerId, pattern: &str, now: Timestamp) -> Vec<Tuple> {
        self.tuples
            .values()
            .filter(|tuple| {
                (owner.is_broadcast() || tuple.owner == owner)
                    && key_matches(pattern, &tuple.key)
                    && !tuple.is_expired(now)
            })
            .cloned()
            .collect()
    }

    pub fn register_callback(
        &mut self,
        owner: PeerId,
        pattern: &str,
        hook: TupleCallback,
    ) -> CallbackHandle {
        let handle = CallbackHandle(self.fresh_handle());
        self.callbacks.push(CallbackReg { handle, owner, pattern: pattern.to_string(), hook });
        handle
    }

    pub fn remove_callback(&mut self, handle: CallbackHandle) {
        self.callbacks.retain(|reg| reg.handle != handle);
    }

    // ---- owner side of subscriptions ---------------------------------

    /// Remembers a remote subscriber; duplicates collapse.
    pub fn add_subscriber(&mut self, subscriber: PeerId, owner: PeerId, pattern: &str) {
        let reg = SubscriberReg { subscriber, owner, pattern: pattern.to_string() };
        if !self.subscribers.contains(&reg) {
            log::debug!("tuples: {subscriber} subscribed to {owner}:{pattern}");
            self.subscribers.push(reg);
        }
    }

    pub fn remove_subscriber(&mut self, subscriber: PeerId, owner: PeerId, pattern: &str) {
        self.subscribers.retain(|reg| {
            !(reg.subscriber == subscriber && reg.owner == owner && reg.pattern == pattern)
        });
    }

    /// Peers that asked for changes matching this tuple.
    pub fn subscribers_of(&self, tuple: &Tuple) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .subscribers
            .iter()
            .filter(|reg| {
                (reg.owner.is_broadcast() || reg.owner == tuple.owner)
                    && key_matches(&reg.pattern, &tuple.key)
            })
            .map(|reg| reg.subscriber)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    // ---- subscriber side ---------------------------------------------

    pub fn add_our_subscription(&mut self, owner: PeerId, pattern: &str) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.fresh_handle());
        self.our_subs.push(OurSubscription {
            handle,
            owner,
            pattern: pattern.to_string(),
        });
        handle
    }

    pub fn take_our_subscription(&mut self, handle: SubscriptionHandle) -> Option<OurSubscription> {
        let index = self.our_subs.iter().position(|sub| sub.handle == handle)?;
        Some(self.our_subs.remove(index))
    }

    pub fn our_subscriptions(&self) -> Vec<OurSubscription> {
        self.our_subs.clone()
    }

    // ---- maintenance --------------------------------------------------

    /// Reaps expired tuples.
    pub fn expire_pass(&mut self, now: Timestamp) {
        self.tuples.retain(|_, tuple| !tuple.is_expired(now));
    }

    /// A peer died: its subscriptions stop feeding and its tuples vanish.
    /// A later incarnation pushes everything afresh.
    pub fn purge_peer(&mut self, peer: PeerId) {
        self.subscribers.retain(|reg| reg.subscriber != peer);
        self.tuples.retain(|(owner, _), _| *owner != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn space() -> TupleSpace {
        TupleSpace::new(PeerId(1))
    }

    #[test]
    fn local_set_stamps_and_versions() {
        let mut space = space();
        let now = Timestamp::from_parts(50, 0);
        let first =
            space.local_set(Tuple::new(PeerId(1), "a.b", b"one".to_vec()), now).expect("set");
        let second =
            space.local_set(Tuple::new(PeerId(1), "a.b", b"two".to_vec()), now).expect("set");
        assert!(second.seq > first.seq);
        assert_eq!(
            space.get(PeerId(1), "a.b", now, 4).expect("get").data,
            b"two".to_vec()
        );
    }

    #[test]
    fn stale_versions_are_refused() {
        let mut space = space();
        let mut newer = Tuple::new(PeerId(2), "x", b"new".to_vec());
        newer.seq = 5;
        let mut older = Tuple::new(PeerId(2), "x", b"old".to_vec());
        older.seq = 3;

        assert!(space.insert(newer));
        assert!(!space.insert(older));
        assert_eq!(
            space.get(PeerId(2), "x", Timestamp::ZERO, 4).expect("get").data,
            b"new".to_vec()
        );
    }

    #[test]
    fn callbacks_fire_on_matching_updates_only() {
        let mut space = space();
        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = fired.clone();
            space.register_callback(
                PeerId::BROADCAST,
                "sensor.*",
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        let now = Timestamp::ZERO;
        space.local_set(Tuple::new(PeerId(1), "sensor.temp", vec![1]), now).expect("set");
        space.local_set(Tuple::new(PeerId(1), "motor.speed", vec![2]), now).expect("set");
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn append_concatenates_in_version_order() {
        let mut space = space();
        let now = Timestamp::ZERO;
        space.local_append("log", b"a", now).expect("append");
        space.local_append("log", b"b", now).expect("append");
        let tuple = space.local_append("log", b"c", now).expect("append");
        assert_eq!(tuple.data, b"abc".to_vec());
    }

    #[test]
    fn metatuples_resolve_on_get() {
        let mut space = space();
        let now = Timestamp::ZERO;
        space
            .local_set(Tuple::new(PeerId(1), "robot.pose", b"here".to_vec()), now)
            .expect("set");
        space
            .local_set(Tuple::meta(PeerId(1), "alias", PeerId(1), "robot.pose"), now)
            .expect("set meta");

        let resolved = space.get(PeerId(1), "alias", now, 4).expect("resolved");
        assert_eq!(resolved.data, b"here".to_vec());
        assert_eq!(resolved.key, "robot.pose");
    }

    #[test]
    fn cyclic_metatuples_stop_at_depth() {
        let mut space = space();
        let now = Timestamp::ZERO;
        space.local_set(Tuple::meta(PeerId(1), "a", PeerId(1), "b"), now).expect("set");
        space.local_set(Tuple::meta(PeerId(1), "b", PeerId(1), "a"), now).expect("set");
        assert_eq!(space.get(PeerId(1), "a", now, 8).err(), Some(TupleError::MetaDepth));
    }

    #[test]
    fn expired_tuples_read_as_absent_and_get_reaped() {
        let mut space = space();
        let now = Timestamp::from_parts(100, 0);
        let mut tuple = Tuple::new(PeerId(1), "ttl", b"v".to_vec());
        tuple.ts_expire = Timestamp::from_parts(150, 0);
        space.local_set(tuple, now).expect("set");

        assert!(space.get(PeerId(1), "ttl", Timestamp::from_parts(120, 0), 4).is_ok());
        assert_eq!(
            space.get(PeerId(1), "ttl", Timestamp::from_parts(200, 0), 4).err(),
            Some(TupleError::NotFound)
        );

        space.expire_pass(Timestamp::from_parts(200, 0));
        assert!(space.is_empty());
    }

    #[test]
    fn dead_peer_subscribers_and_tuples_are_purged() {
        let mut space = space();
        space.add_subscriber(PeerId(9), PeerId(1), "a.*");
        let mut remote = Tuple::new(PeerId(9), "their.data", vec![1]);
        remote.seq = 1;
        space.insert(remote);

        space.purge_peer(PeerId(9));
        let probe = Tuple::new(PeerId(1), "a.b", vec![]);
        assert!(space.subscribers_of(&probe).is_empty());
        assert!(space.is_empty());
    }
}
