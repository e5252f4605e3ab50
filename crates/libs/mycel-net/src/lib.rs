//! The mycel middleware kernel: ad-hoc peer-to-peer overlay maintenance
//! (discovery, link management, sequenced distance-vector routing) and a
//! message plane with priority queues, fragmentation and reliable
//! delivery. The tuple layer in `mycel-tuples` builds on this crate.

pub mod ackmgr;
pub mod config;
pub mod connection;
pub mod connmgr;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod iface;
pub mod kernel;
pub mod loopstore;
pub mod periodic;
pub mod queue;
pub mod reassembly;
pub mod router;
pub mod services;

pub use config::NetConfig;
pub use connection::{ConnId, Direction, Greeting};
pub use dispatcher::{Dispatcher, HookAction, HookFn};
pub use error::{DeadHostReason, DeliveryStatus, NetError};
pub use kernel::{Kernel, KernelCore, ThreadedKernel};
pub use queue::AckFn;
