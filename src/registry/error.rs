#![forbid(unsafe_code)]

// Error taxonomy for registry operations

use crate::engine::{EngineError, ParticipantId, RoomId, TransportId};
use thiserror::Error;

/// Errors surfaced by registry operations. These become `{error}` replies
/// on the wire, so the messages are part of the protocol contract.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("No send transport for connection {0}")]
    NoSendTransport(ParticipantId),

    #[error("No receive transport for connection {0}")]
    NoRecvTransport(ParticipantId),

    /// Exact wording consumed by clients to skip an unconsumable track
    #[error("Cannot consume")]
    CannotConsume,

    #[error("Connection not registered: {0}")]
    NotRegistered(ParticipantId),

    #[error("Connection {0} is not in a room")]
    NotInRoom(ParticipantId),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Engine operation failed: {0}")]
    Engine(#[from] EngineError),
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
