//! In-memory implementations of the database and storage ports.
//!
//! These back the binary when no external services are wired in, and give
//! the test suite precise control over token resolution, checksums and
//! storage failures.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    dao::{
        database::{DatabaseAccess, DatabaseResult},
        models::{BeatmapSetUpdates, PlaylistItemRecord, RoomRecord, SoloScoreRecord},
        storage::{ScoreStorage, StorageError, StorageResult},
    },
    dto::score::Score,
};

/// Database port backed by process-local maps.
#[derive(Default)]
pub struct InMemoryDatabase {
    scores: DashMap<u64, SoloScoreRecord>,
    checksums: DashMap<u64, String>,
    rooms: DashMap<u64, RoomRecord>,
    playlist_items: DashMap<u64, Vec<PlaylistItemRecord>>,
    beatmap_queue: Arc<Mutex<Vec<(u32, u64)>>>,
    next_queue_id: AtomicU32,
}

impl InMemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `token` resolvable to the given online identity.
    pub fn set_score_for_token(&self, token: u64, record: SoloScoreRecord) {
        self.scores.insert(token, record);
    }

    /// Forget a previously installed token resolution.
    pub fn clear_score_for_token(&self, token: u64) {
        self.scores.remove(&token);
    }

    pub fn set_beatmap_checksum(&self, beatmap_id: u64, checksum: impl Into<String>) {
        self.checksums.insert(beatmap_id, checksum.into());
    }

    pub fn insert_room(&self, record: RoomRecord) {
        self.rooms.insert(record.room_id, record);
    }

    pub fn room(&self, room_id: u64) -> Option<RoomRecord> {
        self.rooms.get(&room_id).map(|entry| entry.clone())
    }

    /// Append beatmap set ids to the processing queue, assigning queue ids.
    pub async fn push_beatmap_set_updates(&self, set_ids: &[u64]) {
        let mut queue = self.beatmap_queue.lock().await;
        for &set_id in set_ids {
            let queue_id = self.next_queue_id.fetch_add(1, Ordering::SeqCst) + 1;
            queue.push((queue_id, set_id));
        }
    }

    pub fn playlist_items_for(&self, room_id: u64) -> Vec<PlaylistItemRecord> {
        self.playlist_items
            .get(&room_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

impl DatabaseAccess for InMemoryDatabase {
    fn get_score_from_token(
        &self,
        token: u64,
    ) -> BoxFuture<'static, DatabaseResult<Option<SoloScoreRecord>>> {
        let record = self.scores.get(&token).map(|entry| *entry);
        futures::future::ready(Ok(record)).boxed()
    }

    fn get_beatmap_checksum(
        &self,
        beatmap_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<Option<String>>> {
        let checksum = self.checksums.get(&beatmap_id).map(|entry| entry.clone());
        futures::future::ready(Ok(checksum)).boxed()
    }

    fn get_room(&self, room_id: u64) -> BoxFuture<'static, DatabaseResult<Option<RoomRecord>>> {
        let record = self.rooms.get(&room_id).map(|entry| entry.clone());
        futures::future::ready(Ok(record)).boxed()
    }

    fn mark_room_started(
        &self,
        room_id: u64,
        started_at: OffsetDateTime,
    ) -> BoxFuture<'static, DatabaseResult<()>> {
        if let Some(mut record) = self.rooms.get_mut(&room_id) {
            record.started_at = Some(started_at);
        }
        futures::future::ready(Ok(())).boxed()
    }

    fn mark_room_ended(
        &self,
        room_id: u64,
        ended_at: OffsetDateTime,
    ) -> BoxFuture<'static, DatabaseResult<()>> {
        if let Some(mut record) = self.rooms.get_mut(&room_id) {
            record.ended_at = Some(ended_at);
        }
        futures::future::ready(Ok(())).boxed()
    }

    fn add_playlist_item(
        &self,
        room_id: u64,
        item: PlaylistItemRecord,
    ) -> BoxFuture<'static, DatabaseResult<()>> {
        self.playlist_items.entry(room_id).or_default().push(item);
        futures::future::ready(Ok(())).boxed()
    }

    fn update_playlist_item(
        &self,
        room_id: u64,
        item: PlaylistItemRecord,
    ) -> BoxFuture<'static, DatabaseResult<()>> {
        if let Some(mut items) = self.playlist_items.get_mut(&room_id) {
            if let Some(existing) = items.iter_mut().find(|existing| existing.id == item.id) {
                *existing = item;
            }
        }
        futures::future::ready(Ok(())).boxed()
    }

    fn remove_playlist_item(
        &self,
        room_id: u64,
        item_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<()>> {
        if let Some(mut items) = self.playlist_items.get_mut(&room_id) {
            items.retain(|item| item.id != item_id);
        }
        futures::future::ready(Ok(())).boxed()
    }

    fn get_all_playlist_items(
        &self,
        room_id: u64,
    ) -> BoxFuture<'static, DatabaseResult<Vec<PlaylistItemRecord>>> {
        futures::future::ready(Ok(self.playlist_items_for(room_id))).boxed()
    }

    fn get_updated_beatmap_sets(
        &self,
        since: Option<u32>,
    ) -> BoxFuture<'static, DatabaseResult<BeatmapSetUpdates>> {
        let queue = Arc::clone(&self.beatmap_queue);
        async move {
            let queue = queue.lock().await;
            let floor = since.unwrap_or(0);
            let mut updates = BeatmapSetUpdates {
                last_processed_queue_id: floor,
                beatmap_set_ids: Vec::new(),
            };
            for &(queue_id, set_id) in queue.iter().filter(|(queue_id, _)| *queue_id > floor) {
                updates.last_processed_queue_id = updates.last_processed_queue_id.max(queue_id);
                updates.beatmap_set_ids.push(set_id);
            }
            Ok(updates)
        }
        .boxed()
    }
}

/// Replay store backed by a vector, with injectable write failures.
#[derive(Default)]
pub struct InMemoryScoreStorage {
    written: Arc<Mutex<Vec<Score>>>,
    write_count: Arc<AtomicU32>,
    fail_remaining: AtomicU32,
}

impl InMemoryScoreStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` writes fail with a storage error.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Snapshot of every successfully written score.
    pub async fn written(&self) -> Vec<Score> {
        self.written.lock().await.clone()
    }
}

impl ScoreStorage for InMemoryScoreStorage {
    fn write(&self, score: Score) -> BoxFuture<'static, StorageResult<()>> {
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if should_fail {
            return futures::future::ready(Err(StorageError::unavailable(
                "injected write failure".into(),
                std::io::Error::other("injected"),
            )))
            .boxed();
        }

        let written = Arc::clone(&self.written);
        let count = Arc::clone(&self.write_count);
        async move {
            written.lock().await.push(score);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}
