//! Error types shared by the bus, channels and tunnels.

use std::io;

/// Failures reported by the host messaging substrate.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Nobody was listening on the other side.
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    /// Every receiver declined to answer.
    #[error("The message port closed before a response was received.")]
    NoResponse,

    #[error("Attempting to use a disconnected port object")]
    PortClosed,

    /// The message could not be serialized across the boundary (size, UTF-8, JSON).
    #[error("message transfer failed: {0}")]
    Transfer(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the messaging layer itself.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `disconnect` is generated by the transport and cannot be emitted.
    #[error("event '{0}' is reserved")]
    ReservedEvent(String),

    #[error("channel '{0}' is disconnected")]
    Disconnected(String),

    #[error("operation not available in this context: {0}")]
    WrongContext(&'static str),

    /// A broker for this tunnel name is already running in this context.
    #[error("tunnel '{0}' is already served")]
    AlreadyServed(String),

    #[error("delivery failed: {0}")]
    Delivery(#[from] HostError),

    #[error("listener failed: {0}")]
    Listener(String),

    /// The owning service was dropped before the operation completed.
    #[error("messaging service closed")]
    Closed,

    #[error("config error: {0}")]
    Config(String),
}

pub type HostResult<T> = Result<T, HostError>;
pub type BusResult<T> = Result<T, BusError>;
