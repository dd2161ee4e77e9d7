use thiserror::Error;

use crate::dao::{database::DatabaseError, storage::StorageError};

/// Result alias used by room operations and the hub dispatch layer.
pub type MultiplayerResult<T> = Result<T, MultiplayerError>;

/// Failure kinds surfaced by multiplayer operations.
///
/// Each variant maps to a stable wire code so clients can localize the
/// message without parsing English text.
#[derive(Debug, Error)]
pub enum MultiplayerError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("state change not permitted: {0}")]
    InvalidStateChange(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("client transport closed")]
    TransportClosed,
    #[error("server is shutting down")]
    ServerShuttingDown,
    #[error("database unavailable")]
    DatabaseUnavailable(#[source] DatabaseError),
    #[error("storage unavailable")]
    StorageUnavailable(#[source] StorageError),
}

impl MultiplayerError {
    /// Stable numeric code carried in RPC reply envelopes.
    pub fn wire_code(&self) -> u16 {
        match self {
            MultiplayerError::InvalidState(_) => 4001,
            MultiplayerError::InvalidStateChange(_) => 4002,
            MultiplayerError::NotAuthorized(_) => 4003,
            MultiplayerError::NotFound(_) => 4004,
            MultiplayerError::TransportClosed => 4008,
            MultiplayerError::ServerShuttingDown => 4010,
            MultiplayerError::DatabaseUnavailable(_) => 5001,
            MultiplayerError::StorageUnavailable(_) => 5002,
        }
    }

    /// Shorthand for the most common failure kind.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        MultiplayerError::InvalidState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        MultiplayerError::NotFound(message.into())
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        MultiplayerError::NotAuthorized(message.into())
    }
}

impl From<DatabaseError> for MultiplayerError {
    fn from(err: DatabaseError) -> Self {
        MultiplayerError::DatabaseUnavailable(err)
    }
}

impl From<StorageError> for MultiplayerError {
    fn from(err: StorageError) -> Self {
        MultiplayerError::StorageUnavailable(err)
    }
}
