use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("no route to destination")]
    NoRoute,
    #[error("outgoing queue is full")]
    QueueFull,
    #[error("dropped by early-detection curve")]
    RedDrop,
    #[error("package pool exhausted")]
    PoolExhausted,
    #[error("acknowledgement callback slots exhausted")]
    InvalidCallback,
    #[error("payload exceeds what the message plane can carry")]
    TooLarge,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("no such connection")]
    UnknownConnection,
    #[error("link driver failure")]
    DriverFailure,
    #[error("listen ports exhausted")]
    PortsExhausted,
    #[error("kernel is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Core(#[from] mycel_core::CoreError),
}

/// Outcome handed to acknowledgement callbacks. Exactly one of these is
/// delivered per reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Acked,
    RetriesExhausted,
    QueueFull,
    RedDrop,
    ConnectionClosed,
    NoRoute,
}

impl DeliveryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryStatus::Acked)
    }
}

/// Why a peer was declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadHostReason {
    RouteAgedOut = 0,
    DeathMessage = 1,
    Reborn = 2,
}

impl DeadHostReason {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeadHostReason::RouteAgedOut),
            1 => Some(DeadHostReason::DeathMessage),
            2 => Some(DeadHostReason::Reborn),
            _ => None,
        }
    }
}
