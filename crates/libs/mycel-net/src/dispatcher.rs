//! Port-indexed hook registry. Every package that reaches this peer is
//! offered to the hooks registered on its port, in registration order; a
//! hook may short-circuit the rest of the chain.

use std::collections::HashMap;

use mycel_core::package::port;
use mycel_core::Package;

use crate::connection::ConnId;
use crate::kernel::KernelCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop,
}

pub type HookFn = Box<dyn FnMut(&Package, Option<ConnId>, &mut KernelCore) -> HookAction + Send>;

#[derive(Default)]
pub struct Dispatcher {
    hooks: HashMap<u16, Vec<HookFn>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { hooks: HashMap::new() }
    }

    pub fn register(&mut self, port: u16, hook: HookFn) {
        if port >= port::NPORTS {
            log::warn!("dispatcher: ignoring hook for out-of-range port {port}");
            return;
        }
        self.hooks.entry(port).or_default().push(hook);
    }

    pub fn has_hooks(&self, port: u16) -> bool {
        self.hooks.get(&port).map(|chain| !chain.is_empty()).unwrap_or(false)
    }

    /// Runs the chain for the package's port. Returns true when at least
    /// one hook saw the package.
    pub fn dispatch(
        &mut self,
        package: &Package,
        via: Option<ConnId>,
        core: &mut KernelCore,
    ) -> bool {
        let Some(chain) = self.hooks.get_mut(&package.port) else {
            log::trace!("dispatcher: no hooks on port {}", package.port);
            return false;
        };

        let mut seen = false;
        for hook in chain.iter_mut() {
            seen = true;
            if hook(package, via, core) == HookAction::Stop {
                break;
            }
        }
        seen
    }
}
