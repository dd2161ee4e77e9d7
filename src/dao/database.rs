use std::{error::Error, future::Future, time::Duration};

use futures::future::BoxFuture;
use rand::Rng;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::warn;

use crate::dao::models::{BeatmapSetUpdates, PlaylistItemRecord, RoomRecord, SoloScoreRecord};

/// Result alias for database port operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Error raised by the database port regardless of the backing driver.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl DatabaseError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        DatabaseError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Abstraction over the relational backend consumed by the multiplayer
/// server: score identity lookups, beatmap checksums, room lifecycle markers
/// and the playlist mirror.
pub trait DatabaseAccess: Send + Sync {
    fn get_score_from_token(
        &self,
        token: u64,
    ) -> BoxFuture<'static, DatabaseResult<Option<SoloScoreRecord>>>;
    fn get_beatmap_checksum(
        &self,
        beatmap_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<Option<String>>>;
    fn get_room(&self, room_id: u64) -> BoxFuture<'static, DatabaseResult<Option<RoomRecord>>>;
    fn mark_room_started(
        &self,
        room_id: u64,
        started_at: OffsetDateTime,
    ) -> BoxFuture<'static, DatabaseResult<()>>;
    fn mark_room_ended(
        &self,
        room_id: u64,
        ended_at: OffsetDateTime,
    ) -> BoxFuture<'static, DatabaseResult<()>>;
    fn add_playlist_item(
        &self,
        room_id: u64,
        item: PlaylistItemRecord,
    ) -> BoxFuture<'static, DatabaseResult<()>>;
    fn update_playlist_item(
        &self,
        room_id: u64,
        item: PlaylistItemRecord,
    ) -> BoxFuture<'static, DatabaseResult<()>>;
    fn remove_playlist_item(
        &self,
        room_id: u64,
        item_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<()>>;
    fn get_all_playlist_items(
        &self,
        room_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<Vec<PlaylistItemRecord>>>;
    fn get_updated_beatmap_sets(
        &self,
        since: Option<u32>,
    ) -> BoxFuture<'static, DatabaseResult<BeatmapSetUpdates>>;
}

/// Run a database read, retrying once with a short jittered delay before
/// surfacing the failure to the caller.
pub async fn read_with_retry<T, F, Fut>(operation: F) -> DatabaseResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DatabaseResult<T>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(err) => {
            let jitter = Duration::from_millis(rand::rng().random_range(25..=100));
            warn!(
                error = %err,
                delay_ms = jitter.as_millis() as u64,
                "database read failed; retrying once"
            );
            sleep(jitter).await;
            operation().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn io_failure() -> DatabaseError {
        DatabaseError::unavailable(
            "lost connection".into(),
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        )
    }

    #[tokio::test]
    async fn read_with_retry_recovers_from_one_failure() {
        let attempts = AtomicU32::new(0);
        let result = read_with_retry(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(io_failure())
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_with_retry_surfaces_second_failure() {
        let attempts = AtomicU32::new(0);
        let result: DatabaseResult<u64> = read_with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(io_failure()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
