//! Error taxonomy for the transport.
//!
//! Mirrors the four classes from the design: unrecoverable startup
//! failures, retryable room-service faults, invalid application-level
//! calls, and protocol violations (which are logged and dropped, never
//! propagated — see `inbound` and `room_manager`).

use crate::address::Address;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("room service error: {0}")]
    RoomService(#[from] RoomServiceError),

    #[error("invalid address for send_async: {0:?}")]
    InvalidAddress(Address),

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,
}

/// A fault surfaced by the `RoomClient` collaborator. Treated as
/// retryable by callers unless noted otherwise.
#[derive(Debug, thiserror::Error, Clone)]
#[error("{0}")]
pub struct RoomServiceError(pub String);

impl RoomServiceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
