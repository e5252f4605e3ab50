//! Kernel wiring for the tuple space. Tuple traffic rides the reserved
//! service ports: subscriptions toward owners, pushed values back to
//! subscribers, remote set and append requests toward the owner who alone
//! writes under its own clock. Oversized values travel as long messages
//! without any handling here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mycel_core::package::port;
use mycel_core::{CoreError, InputBuffer, OutputBuffer, PackageFlags, PeerId, Wire};
use mycel_net::dispatcher::HookAction;
use mycel_net::kernel::{Kernel, KernelCore};

use crate::error::TupleError;
use crate::space::{CallbackHandle, SubscriptionHandle, TupleCallback, TupleSpace};
use crate::tuple::Tuple;

const EXPIRY_PERIOD: Duration = Duration::from_secs(5);
const SUBSCRIPTION_REFRESH_PERIOD: Duration = Duration::from_secs(30);

type SharedSpace = Arc<Mutex<TupleSpace>>;

fn lock(space: &SharedSpace) -> MutexGuard<'_, TupleSpace> {
    match space.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn encode_subscription(owner: PeerId, pattern: &str) -> Result<Vec<u8>, CoreError> {
    let mut raw = vec![0u8; 8 + pattern.len()];
    let mut out = OutputBuffer::new(&mut raw);
    owner.serialize(&mut out)?;
    out.write_u16(pattern.len() as u16)?;
    out.write(pattern.as_bytes())?;
    let len = out.offset();
    raw.truncate(len);
    Ok(raw)
}

fn decode_subscription(payload: &[u8]) -> Result<(PeerId, String), CoreError> {
    let mut input = InputBuffer::new(payload);
    let owner = PeerId::deserialize(&mut input)?;
    let len = input.read_u16()? as usize;
    let pattern = String::from_utf8_lossy(input.read_slice(len)?).into_owned();
    Ok((owner, pattern))
}

/// The distributed tuple space of one component.
pub struct TupleService {
    space: SharedSpace,
}

impl TupleService {
    /// Hooks the tuple ports, the dead-host cascade and the maintenance
    /// periodics into a kernel and returns the service handle.
    pub fn attach(kernel: &mut Kernel) -> Self {
        let space: SharedSpace =
            Arc::new(Mutex::new(TupleSpace::new(kernel.core().own_id)));

        {
            let space = space.clone();
            kernel.register_hook(
                port::SUBSCRIBE,
                Box::new(move |package, _via, core| {
                    subscribe_hook(&space, package, core);
                    HookAction::Stop
                }),
            );
        }
        {
            let space = space.clone();
            kernel.register_hook(
                port::UNSUBSCRIBE,
                Box::new(move |package, _via, _core| {
                    if let Ok((owner, pattern)) = decode_subscription(&package.payload) {
                        lock(&space).remove_subscriber(package.source, owner, &pattern);
                    }
                    HookAction::Stop
                }),
            );
        }
        for push_port in [port::PUSH_TUPLE, port::PUSH_APPENDED_TUPLE] {
            let space = space.clone();
            kernel.register_hook(
                push_port,
                Box::new(move |package, _via, _core| {
                    match Tuple::from_bytes(&package.payload) {
                        Ok(tuple) => {
                            lock(&space).insert(tuple);
                        }
                        Err(_) => {
                            log::debug!("tuples: malformed push from {}", package.source)
                        }
                    }
                    HookAction::Stop
                }),
            );
        }
        {
            let space = space.clone();
            kernel.register_hook(
                port::SET_REMOTE_TUPLE,
                Box::new(move |package, _via, core| {
                    set_remote_hook(&space, package, core);
                    HookAction::Stop
                }),
            );
        }
        {
            let space = space.clone();
            kernel.register_hook(
                port::SET_APPEND_TUPLE,
                Box::new(move |package, _via, core| {
                    append_remote_hook(&space, package, core);
                    HookAction::Stop
                }),
            );
        }

        {
            let space = space.clone();
            kernel.core_mut().on_dead_host(Box::new(move |peer, _reason| {
                lock(&space).purge_peer(peer);
            }));
        }

        {
            let space = space.clone();
            kernel.register_periodic(
                "tuple-expiry",
                EXPIRY_PERIOD,
                Box::new(move |core| {
                    let now = core.clock.now();
                    lock(&space).expire_pass(now);
                }),
            );
        }
        {
            // Subscriptions survive owner restarts by being re-announced.
            let space = space.clone();
            kernel.register_periodic(
                "subscription-refresh",
                SUBSCRIPTION_REFRESH_PERIOD,
                Box::new(move |core| {
                    let subs = lock(&space).our_subscriptions();
                    for sub in subs {
                        send_subscription(core, port::SUBSCRIBE, sub.owner, &sub.pattern);
                    }
                }),
            );
        }

        Self { space }
    }

    // ---- producer API -------------------------------------------------

    /// Writes a tuple owned by this component and feeds every subscriber.
    pub fn set(&self, core: &mut KernelCore, tuple: Tuple) -> Result<Tuple, TupleError> {
        let now = core.clock.now();
        let written = lock(&self.space).local_set(tuple, now)?;
        self.push_to_subscribers(core, &written, port::PUSH_TUPLE);
        Ok(written)
    }

    /// Sets a tuple owned by another peer: the value travels to the owner
    /// and only the owner's space appends it under its own clock.
    pub fn set_remote(
        &self,
        core: &mut KernelCore,
        owner: PeerId,
        tuple: Tuple,
    ) -> Result<(), TupleError> {
        let payload = tuple.to_bytes()?;
        core.send_reliable(owner, port::SET_REMOTE_TUPLE, payload, None)?;
        Ok(())
    }

    /// Appends to a tuple. Local owner appends immediately; a remote
    /// owner gets an append request and serialises the suffixes itself.
    pub fn append(
        &self,
        core: &mut KernelCore,
        owner: PeerId,
        key: &str,
        suffix: &[u8],
    ) -> Result<(), TupleError> {
        if owner == core.own_id {
            let now = core.clock.now();
            let appended = lock(&self.space).local_append(key, suffix, now)?;
            self.push_to_subscribers(core, &appended, port::PUSH_APPENDED_TUPLE);
            return Ok(());
        }

        let request = Tuple::new(owner, key, suffix.to_vec());
        let payload = request.to_bytes()?;
        core.send_reliable(owner, port::SET_APPEND_TUPLE, payload, None)?;
        Ok(())
    }

    fn push_to_subscribers(&self, core: &mut KernelCore, tuple: &Tuple, push_port: u16) {
        let subscribers = lock(&self.space).subscribers_of(tuple);
        if subscribers.is_empty() {
            return;
        }
        let Ok(payload) = tuple.to_bytes() else { return };
        for subscriber in subscribers {
            if subscriber == core.own_id {
                continue;
            }
            if let Err(err) =
                core.send_reliable(subscriber, push_port, payload.clone(), None)
            {
                log::debug!("tuples: push of {tuple} to {subscriber} failed: {err}");
            }
        }
    }

    // ---- consumer API -------------------------------------------------

    /// Asks `owner` (or, for the broadcast owner, everyone) to stream
    /// changes matching `pattern`.
    pub fn subscribe(
        &self,
        core: &mut KernelCore,
        owner: PeerId,
        pattern: &str,
    ) -> Result<SubscriptionHandle, TupleError> {
        crate::tuple::validate_key(pattern)?;
        let handle = lock(&self.space).add_our_subscription(owner, pattern);
        send_subscription(core, port::SUBSCRIBE, owner, pattern);
        Ok(handle)
    }

    pub fn unsubscribe(
        &self,
        core: &mut KernelCore,
        handle: SubscriptionHandle,
    ) -> Result<(), TupleError> {
        let sub =
            lock(&self.space).take_our_subscription(handle).ok_or(TupleError::NotFound)?;
        send_subscription(core, port::UNSUBSCRIBE, sub.owner, &sub.pattern);
        Ok(())
    }

    /// Runs `hook` for every accepted tuple update matching the pattern.
    pub fn register_callback(
        &self,
        owner: PeerId,
        pattern: &str,
        hook: TupleCallback,
    ) -> CallbackHandle {
        lock(&self.space).register_callback(owner, pattern, hook)
    }

    pub fn remove_callback(&self, handle: CallbackHandle) {
        lock(&self.space).remove_callback(handle);
    }

    /// Local read with metatuple resolution.
    pub fn get(&self, core: &KernelCore, owner: PeerId, key: &str) -> Result<Tuple, TupleError> {
        let now = core.clock.now();
        lock(&self.space).get(owner, key, now, core.config.max_meta_depth)
    }

    /// Direct access for tests and tooling.
    pub fn space(&self) -> SharedSpace {
        self.space.clone()
    }
}

fn send_subscription(core: &mut KernelCore, service: u16, owner: PeerId, pattern: &str) {
    let Ok(payload) = encode_subscription(owner, pattern) else { return };
    let result = if owner.is_broadcast() {
        core.broadcast(service, payload, PackageFlags::default())
    } else {
        core.send_reliable(owner, service, payload, None)
    };
    if let Err(err) = result {
        log::debug!("tuples: subscription message to {owner} failed: {err}");
    }
}

/// Owner side of SUBSCRIBE: remember the subscriber and push the current
/// value of everything already matching, so a new subscriber starts from
/// the present state instead of the next change.
fn subscribe_hook(space: &SharedSpace, package: &mycel_core::Package, core: &mut KernelCore) {
    let Ok((owner, pattern)) = decode_subscription(&package.payload) else {
        log::debug!("tuples: malformed subscription from {}", package.source);
        return;
    };
    if !owner.is_broadcast() && owner != core.own_id {
        // Not ours to serve; a broadcast subscription reaches the real
        // owner on its own.
        return;
    }

    let now = core.clock.now();
    let initial = {
        let mut space = lock(space);
        space.add_subscriber(package.source, owner, &pattern);
        space.matching_tuples(core.own_id, &pattern, now)
    };

    for tuple in initial {
        if let Ok(payload) = tuple.to_bytes() {
            let _ = core.send_reliable(package.source, port::PUSH_TUPLE, payload, None);
        }
    }
}

/// Owner side of SET_REMOTE: adopt the value as our own write.
fn set_remote_hook(space: &SharedSpace, package: &mycel_core::Package, core: &mut KernelCore) {
    let Ok(tuple) = Tuple::from_bytes(&package.payload) else {
        log::debug!("tuples: malformed remote set from {}", package.source);
        return;
    };
    let now = core.clock.now();
    let written = {
        let mut guard = lock(space);
        guard.local_set(tuple, now)
    };
    if let Ok(written) = written {
        push_from_hook(space, core, &written, port::PUSH_TUPLE);
    }
}

/// Owner side of SET_APPEND: only we append, under our clock, so all
/// subscribers agree on the concatenation order.
fn append_remote_hook(space: &SharedSpace, package: &mycel_core::Package, core: &mut KernelCore) {
    let Ok(request) = Tuple::from_bytes(&package.payload) else {
        log::debug!("tuples: malformed append from {}", package.source);
        return;
    };
    let now = core.clock.now();
    let appended = {
        let mut guard = lock(space);
        guard.local_append(&request.key, &request.data, now)
    };
    if let Ok(appended) = appended {
        push_from_hook(space, core, &appended, port::PUSH_APPENDED_TUPLE);
    }
}

fn push_from_hook(space: &SharedSpace, core: &mut KernelCore, tuple: &Tuple, push_port: u16) {
    let subscribers = lock(space).subscribers_of(tuple);
    let Ok(payload) = tuple.to_bytes() else { return };
    for subscriber in subscribers {
        if subscriber == core.own_id {
            continue;
        }
        let _ = core.send_reliable(subscriber, push_port, payload.clone(), None);
    }
}
