use std::error::Error;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::dto::score::Score;

/// Result alias for blob storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by the replay storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Blob store for finalized scores, keyed by their online id.
///
/// Any failure is terminal for that score; the upload pipeline never
/// retries a write.
pub trait ScoreStorage: Send + Sync {
    fn write(&self, score: Score) -> BoxFuture<'static, StorageResult<()>>;
}
