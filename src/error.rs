//! Domain error taxonomy shared by every command surface.

use thiserror::Error;
use validator::ValidationErrors;

use crate::store::StoreError;

/// Result alias for domain commands.
pub type RoomResult<T> = Result<T, RoomError>;

/// Errors surfaced by room session commands.
///
/// Every domain-command failure is caught at the repository boundary, logged,
/// and returned as one of these typed variants; callers decide how to present
/// them and never observe raw transport errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Room code does not exist or the room expired from inactivity.
    #[error("room `{0}` not found")]
    RoomNotFound(String),
    /// Room could not be created (code space exhausted or the initial write failed).
    #[error("failed to create room: {0}")]
    RoomCreation(String),
    /// The targeted round no longer holds the lock (lost buzz race, or the
    /// round was reset between buzz and action).
    #[error("round is no longer open")]
    StaleRound,
    /// The host has closed the buzz gate; no buzzes are accepted.
    #[error("buzzing is currently disabled")]
    BuzzDisabled,
    /// The audio relay negotiation could not complete.
    #[error(transparent)]
    Signaling(#[from] SignalingFailure),
    /// Malformed input (empty name, bad room code, empty answer).
    #[error("invalid input: {0}")]
    Validation(String),
    /// A host-only command was issued by a non-host member.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The replicated store rejected or failed the operation.
    #[error("store operation failed")]
    Store(#[from] StoreError),
}

impl From<ValidationErrors> for RoomError {
    fn from(err: ValidationErrors) -> Self {
        RoomError::Validation(format!("validation failed: {err}"))
    }
}

/// Reasons the audio relay handshake can fail. Never fatal to the room.
#[derive(Debug, Error)]
pub enum SignalingFailure {
    /// The platform denied access to the capture device.
    #[error("media capture denied: {0}")]
    CaptureDenied(String),
    /// Offer/answer/candidate exchange broke down.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The coordinator was stopped while an operation was in flight.
    #[error("connection closed")]
    Closed,
}
