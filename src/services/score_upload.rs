//! The replay upload pipeline.
//!
//! Completed plays are enqueued with their score token; workers poll the
//! database until the token resolves to an online identity, merge that
//! identity into the local score, and write the result to blob storage.
//! Items that time out, fail to write, or arrive while uploads are disabled
//! are dropped and never retried, so one bad payload cannot stall the queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    sync::{Mutex, Notify, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{
    config::ServerConfig,
    dao::{database::DatabaseAccess, models::SoloScoreRecord, storage::ScoreStorage},
    dto::score::Score,
};

const POLL_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const POLL_BACKOFF_MAX: Duration = Duration::from_millis(250);

struct UploadItem {
    token: u64,
    score: Score,
    enqueued_at: Instant,
}

enum TokenResolution {
    Resolved(SoloScoreRecord),
    TimedOut,
    Cancelled,
}

/// Bounded-concurrency consumer joining local score data with the
/// database-resolved online identity.
pub struct ScoreUploader {
    tx: Mutex<Option<mpsc::UnboundedSender<UploadItem>>>,
    remaining: Arc<AtomicU64>,
    drained: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ScoreUploader {
    /// Start the worker tasks. The worker count comes from
    /// `replay_uploader_concurrency`; the replay switch is re-read for every
    /// item so runtime changes take effect at the next pickup.
    pub fn new(
        database: Arc<dyn DatabaseAccess>,
        storage: Arc<dyn ScoreStorage>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let remaining = Arc::new(AtomicU64::new(0));
        let drained = Arc::new(Notify::new());

        let workers = (0..config.replay_uploader_concurrency().max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&database),
                    Arc::clone(&storage),
                    Arc::clone(&config),
                    Arc::clone(&remaining),
                    Arc::clone(&drained),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            remaining,
            drained,
            workers: Mutex::new(workers),
            shutdown_tx,
        }
    }

    /// Hand a completed play to the pipeline. Never blocks beyond buffering;
    /// scores arriving after shutdown are dropped with a warning.
    pub async fn enqueue(&self, token: u64, score: Score) {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            warn!(token, "upload pipeline is closed; dropping score");
            return;
        };

        self.remaining.fetch_add(1, Ordering::AcqRel);
        let item = UploadItem {
            token,
            score,
            enqueued_at: Instant::now(),
        };
        if tx.send(item).is_err() {
            self.remaining.fetch_sub(1, Ordering::AcqRel);
            warn!(token, "upload pipeline workers are gone; dropping score");
        }
    }

    /// Items still owned by the pipeline: queued plus in flight.
    pub fn remaining_usages(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait until every accepted item has been uploaded or dropped.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before re-checking so a drain signal cannot slip
            // between the check and the await.
            notified.as_mut().enable();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop intake, let in-flight writes finish, and join the workers.
    /// In-flight token polls observe the cancellation at their next yield.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.tx.lock().await;
            guard.take();
        }
        let _ = self.shutdown_tx.send(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker: u32,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<UploadItem>>>,
    database: Arc<dyn DatabaseAccess>,
    storage: Arc<dyn ScoreStorage>,
    config: Arc<ServerConfig>,
    remaining: Arc<AtomicU64>,
    drained: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let item = { rx.lock().await.recv().await };
        let Some(item) = item else {
            break;
        };

        process_item(&*database, &*storage, &config, &shutdown_rx, item).await;

        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            drained.notify_waiters();
        }
    }
    debug!(worker, "upload worker stopped");
}

async fn process_item(
    database: &dyn DatabaseAccess,
    storage: &dyn ScoreStorage,
    config: &ServerConfig,
    shutdown_rx: &watch::Receiver<bool>,
    item: UploadItem,
) {
    let token = item.token;
    let record = match resolve_token(database, config.upload_timeout(), shutdown_rx, &item).await {
        TokenResolution::Resolved(record) => record,
        TokenResolution::TimedOut => {
            warn!(token, "score upload timed out");
            return;
        }
        TokenResolution::Cancelled => {
            warn!(token, "score upload cancelled by shutdown");
            return;
        }
    };

    // Merge the online identity into the locally captured score; every
    // other local field (user, statistics, frames) is preserved.
    let mut score = item.score;
    score.info.online_id = Some(record.id);
    score.info.passed = record.passed;

    if !config.save_replays() {
        return;
    }

    if let Err(err) = storage.write(score).await {
        warn!(token, error = %err, "replay upload failed; score discarded");
    }
}

/// Poll the token with backoff until it resolves, the wall-clock timeout
/// computed against the enqueue time passes, or shutdown is signaled.
async fn resolve_token(
    database: &dyn DatabaseAccess,
    timeout: Duration,
    shutdown_rx: &watch::Receiver<bool>,
    item: &UploadItem,
) -> TokenResolution {
    let deadline = item.enqueued_at + timeout;
    let mut shutdown_rx = shutdown_rx.clone();
    let mut backoff = POLL_BACKOFF_INITIAL;

    loop {
        if *shutdown_rx.borrow() {
            return TokenResolution::Cancelled;
        }

        match database.get_score_from_token(item.token).await {
            Ok(Some(record)) => return TokenResolution::Resolved(record),
            Ok(None) => {}
            Err(err) => {
                warn!(token = item.token, error = %err, "token lookup failed; will poll again")
            }
        }

        if Instant::now() >= deadline {
            return TokenResolution::TimedOut;
        }

        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown_rx.changed() => return TokenResolution::Cancelled,
        }
        backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::memory::{InMemoryDatabase, InMemoryScoreStorage},
        dto::score::{ApiUser, ScoreInfo},
    };

    fn uploader_with(
        save_replays: bool,
        concurrency: u32,
        timeout: Duration,
    ) -> (
        ScoreUploader,
        Arc<InMemoryDatabase>,
        Arc<InMemoryScoreStorage>,
    ) {
        let database = InMemoryDatabase::new();
        let storage = InMemoryScoreStorage::new();
        let config = Arc::new(ServerConfig::for_tests(save_replays, concurrency, timeout));
        let uploader = ScoreUploader::new(
            database.clone() as Arc<dyn DatabaseAccess>,
            storage.clone() as Arc<dyn ScoreStorage>,
            config,
        );
        (uploader, database, storage)
    }

    fn local_score(user_id: i64, username: &str) -> Score {
        Score::new(ScoreInfo::new(
            ApiUser {
                id: user_id,
                username: username.into(),
            },
            0,
            42,
        ))
    }

    #[tokio::test]
    async fn score_data_merged_correctly() {
        let (uploader, database, storage) =
            uploader_with(true, 1, Duration::from_secs(30));
        database.set_score_for_token(1, SoloScoreRecord { id: 2, passed: true });

        uploader
            .enqueue(1, local_score(1234, "some user"))
            .await;
        uploader.flush().await;

        let written = storage.written().await;
        assert_eq!(written.len(), 1);
        let uploaded = &written[0];
        assert_eq!(uploaded.info.online_id, Some(2));
        assert!(uploaded.info.passed);
        assert_eq!(uploaded.info.user.username, "some user");
        assert_eq!(uploaded.info.user.id, 1234);
    }

    #[tokio::test]
    async fn score_does_not_upload_if_disabled() {
        let (uploader, database, storage) =
            uploader_with(false, 1, Duration::from_secs(30));
        database.set_score_for_token(1, SoloScoreRecord { id: 2, passed: true });

        uploader.enqueue(1, local_score(1, "player")).await;
        uploader.flush().await;

        assert_eq!(storage.write_count(), 0);
        assert_eq!(uploader.remaining_usages(), 0);
    }

    #[tokio::test]
    async fn timed_out_score_does_not_upload() {
        let (uploader, database, storage) = uploader_with(true, 1, Duration::ZERO);

        // Token 2 is unresolvable at enqueue time; the zero timeout drops it
        // after the first poll even though it resolves later.
        uploader.enqueue(2, local_score(1, "late")).await;
        uploader.flush().await;
        database.set_score_for_token(2, SoloScoreRecord { id: 3, passed: true });
        assert_eq!(storage.write_count(), 0);

        // The pipeline is not stuck: an immediately resolvable token still
        // uploads.
        database.set_score_for_token(3, SoloScoreRecord { id: 4, passed: true });
        uploader.enqueue(3, local_score(1, "on time")).await;
        uploader.flush().await;
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn failed_score_handled_gracefully() {
        let (uploader, database, storage) =
            uploader_with(true, 1, Duration::from_secs(30));
        database.set_score_for_token(1, SoloScoreRecord { id: 2, passed: true });
        storage.fail_next_writes(1);

        uploader.enqueue(1, local_score(1, "unlucky")).await;
        uploader.flush().await;
        assert_eq!(storage.write_count(), 0);

        // The failed item is gone for good; a fresh enqueue against healthy
        // storage produces exactly one write.
        database.set_score_for_token(2, SoloScoreRecord { id: 3, passed: true });
        uploader.enqueue(2, local_score(1, "lucky")).await;
        uploader.flush().await;
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn mass_uploads() {
        let (uploader, database, storage) =
            uploader_with(true, 4, Duration::from_secs(30));

        for token in 0..1000u64 {
            database.set_score_for_token(
                token,
                SoloScoreRecord {
                    id: token + 10_000,
                    passed: true,
                },
            );
        }
        for token in 0..1000u64 {
            uploader.enqueue(token, local_score(token as i64, "bulk")).await;
        }

        uploader.flush().await;
        assert_eq!(storage.write_count(), 1000);
        assert_eq!(uploader.remaining_usages(), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_items() {
        let (uploader, database, storage) =
            uploader_with(true, 1, Duration::from_secs(30));
        database.set_score_for_token(1, SoloScoreRecord { id: 2, passed: true });

        uploader.shutdown().await;
        uploader.enqueue(1, local_score(1, "too late")).await;

        assert_eq!(uploader.remaining_usages(), 0);
        assert_eq!(storage.write_count(), 0);
    }
}
