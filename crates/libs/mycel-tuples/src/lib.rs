//! Distributed tuple space on top of the mycel kernel. Every tuple is a
//! named binary value owned by one peer; subscribers anywhere in the
//! overlay receive pushed changes, callbacks fire on matching updates,
//! and metatuples add one level of indirection resolved on read.

pub mod error;
pub mod service;
pub mod space;
pub mod tuple;

pub use error::TupleError;
pub use service::TupleService;
pub use space::{CallbackHandle, SubscriptionHandle, TupleSpace};
pub use tuple::{key_matches, Tuple, TupleEncoding};
