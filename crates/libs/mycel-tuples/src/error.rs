use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TupleError {
    #[error("no such tuple")]
    NotFound,
    #[error("tuple key is not valid")]
    BadKey,
    #[error("metatuple chain too deep or cyclic")]
    MetaDepth,
    #[error("tuple is not a metatuple")]
    NotMeta,
    #[error(transparent)]
    Net(#[from] mycel_net::NetError),
    #[error(transparent)]
    Core(#[from] mycel_core::CoreError),
}
