//! Typed, cancellable per-room countdowns.
//!
//! Every active countdown owns a spawned delay task governed by two
//! independent signals: *stop* cancels the delay and skips the completion
//! callback, *skip* cancels the delay and runs the callback immediately.
//! The callback never runs under the usage that started the countdown; the
//! task re-acquires a fresh usage from the registry first.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;
use utoipa::ToSchema;

use crate::{
    error::{MultiplayerError, MultiplayerResult},
    services::hub_service,
    state::{SharedState, registry::RoomUsage},
};

pub type CountdownId = u32;

/// Discriminant used for the one-per-kind rule and wire payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CountdownKind {
    MatchStart,
    ForceGameplayStart,
    ServerShutdown,
}

/// The closed set of countdowns a room can run.
#[derive(Debug, Clone, Copy)]
pub enum Countdown {
    /// Starts the match when it fires.
    MatchStart { duration: Duration },
    /// Forces gameplay to begin, idling users that never finished loading.
    ForceGameplayStart { duration: Duration },
    /// Closes the room as part of graceful shutdown.
    ServerShutdown { duration: Duration },
}

impl Countdown {
    pub fn kind(&self) -> CountdownKind {
        match self {
            Countdown::MatchStart { .. } => CountdownKind::MatchStart,
            Countdown::ForceGameplayStart { .. } => CountdownKind::ForceGameplayStart,
            Countdown::ServerShutdown { .. } => CountdownKind::ServerShutdown,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Countdown::MatchStart { duration }
            | Countdown::ForceGameplayStart { duration }
            | Countdown::ServerShutdown { duration } => *duration,
        }
    }
}

/// Completion callback run under a freshly acquired usage.
pub type CountdownContinuation =
    Box<dyn for<'a> FnOnce(&'a SharedState, &'a mut RoomUsage) -> BoxFuture<'a, ()> + Send>;

/// A countdown currently running in a room.
#[derive(Debug)]
pub struct ActiveCountdown {
    pub id: CountdownId,
    countdown: Countdown,
    started_at: Instant,
    stop_tx: watch::Sender<bool>,
    skip_tx: watch::Sender<bool>,
    completion_rx: watch::Receiver<bool>,
}

impl ActiveCountdown {
    pub fn kind(&self) -> CountdownKind {
        self.countdown.kind()
    }

    /// Wall-clock time left, recomputed on every serialization so each new
    /// observer sees a fresh value. Clamped at zero.
    pub fn time_remaining(&self) -> Duration {
        self.countdown
            .duration()
            .saturating_sub(self.started_at.elapsed())
    }

    /// Cancel the delay without running the completion callback.
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn signal_skip(&self) {
        let _ = self.skip_tx.send(true);
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.completion_rx.clone()
    }
}

/// Start a countdown in the room held by `usage`, displacing any active
/// countdown of the same kind. `on_complete` runs when the delay elapses or
/// is skipped, under a usage acquired by the delay task itself.
pub fn start_countdown(
    state: &SharedState,
    usage: &mut RoomUsage,
    countdown: Countdown,
    on_complete: CountdownContinuation,
) -> CountdownId {
    let id = usage.allocate_countdown_id();
    let room_id = usage.id();

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let (skip_tx, mut skip_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);

    usage.push_countdown(ActiveCountdown {
        id,
        countdown,
        started_at: Instant::now(),
        stop_tx,
        skip_tx,
        completion_rx: done_rx,
    });

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let fired = tokio::select! {
            _ = stop_rx.changed() => false,
            _ = skip_rx.changed() => true,
            _ = sleep(countdown.duration()) => true,
        };

        if fired {
            match state.rooms().get_for_use(room_id).await {
                Ok(mut usage) => {
                    // A stop may have raced the wakeup; it wins.
                    if !*stop_rx.borrow() {
                        if let Some(_completed) = usage.take_countdown(id) {
                            on_complete(&state, &mut usage).await;
                        }
                    }
                    hub_service::finalize_and_publish(&state, &mut usage).await;
                }
                Err(err) => {
                    debug!(room_id, error = %err, "room gone before countdown completion");
                }
            }
        }

        let _ = done_tx.send(true);
    });

    id
}

/// Signal *skip* on a countdown and hand back its completion receiver.
///
/// The caller must release its own usage before awaiting the receiver; the
/// completion callback needs to acquire one.
pub fn skip_to_end(
    usage: &mut RoomUsage,
    id: CountdownId,
) -> MultiplayerResult<watch::Receiver<bool>> {
    let countdown = usage
        .countdowns
        .iter()
        .find(|c| c.id == id)
        .ok_or_else(|| MultiplayerError::not_found(format!("countdown {id} is not active")))?;
    countdown.signal_skip();
    Ok(countdown.completion())
}

/// Await a completion receiver returned by [`skip_to_end`].
pub async fn wait_for_completion(mut completion: watch::Receiver<bool>) {
    let _ = completion.wait_for(|done| *done).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;
    use tokio::time::timeout;

    use super::*;
    use crate::state::{room::RoomState, test_state};

    async fn state_with_room(room_id: u64) -> SharedState {
        let state = test_state();
        let mut usage = state
            .rooms()
            .create_or_acquire(crate::state::room::test_room(room_id))
            .await
            .unwrap();
        usage.join_user(10, None).unwrap();
        usage.take_events();
        state
    }

    fn counting_continuation(counter: Arc<AtomicU32>) -> CountdownContinuation {
        Box::new(move |_state, _usage| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn natural_completion_runs_continuation() {
        let state = state_with_room(1).await;
        let fired = Arc::new(AtomicU32::new(0));

        {
            let mut usage = state.rooms().get_for_use(1).await.unwrap();
            start_countdown(
                &state,
                &mut usage,
                Countdown::MatchStart {
                    duration: Duration::from_secs(5),
                },
                counting_continuation(Arc::clone(&fired)),
            );
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let usage = state.rooms().get_for_use(1).await.unwrap();
        assert!(usage.countdowns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_skips_the_continuation() {
        let state = state_with_room(1).await;
        let fired = Arc::new(AtomicU32::new(0));

        {
            let mut usage = state.rooms().get_for_use(1).await.unwrap();
            let id = start_countdown(
                &state,
                &mut usage,
                Countdown::MatchStart {
                    duration: Duration::from_secs(5),
                },
                counting_continuation(Arc::clone(&fired)),
            );
            usage.stop_countdown_by_id(id);
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skip_runs_continuation_without_waiting() {
        let state = state_with_room(1).await;
        let fired = Arc::new(AtomicU32::new(0));

        let completion = {
            let mut usage = state.rooms().get_for_use(1).await.unwrap();
            let id = start_countdown(
                &state,
                &mut usage,
                Countdown::MatchStart {
                    duration: Duration::from_secs(3600),
                },
                counting_continuation(Arc::clone(&fired)),
            );
            skip_to_end(&mut usage, id).unwrap()
        };

        // Awaiting outside the usage; holding it here would deadlock the
        // continuation's re-acquisition.
        timeout(Duration::from_secs(5), wait_for_completion(completion))
            .await
            .expect("skip must complete promptly");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_countdown_per_kind() {
        let state = state_with_room(1).await;
        let mut usage = state.rooms().get_for_use(1).await.unwrap();

        start_countdown(
            &state,
            &mut usage,
            Countdown::MatchStart {
                duration: Duration::from_secs(3600),
            },
            Box::new(|_, _| async {}.boxed()),
        );
        start_countdown(
            &state,
            &mut usage,
            Countdown::MatchStart {
                duration: Duration::from_secs(3600),
            },
            Box::new(|_, _| async {}.boxed()),
        );

        let match_start_count = usage
            .countdowns
            .iter()
            .filter(|c| c.kind() == CountdownKind::MatchStart)
            .count();
        assert_eq!(match_start_count, 1);
    }

    #[tokio::test]
    async fn continuation_sees_live_room_state() {
        let state = state_with_room(1).await;

        let completion = {
            let mut usage = state.rooms().get_for_use(1).await.unwrap();
            let id = start_countdown(
                &state,
                &mut usage,
                Countdown::MatchStart {
                    duration: Duration::from_secs(3600),
                },
                Box::new(|_state, usage| {
                    async move {
                        assert_eq!(usage.state, RoomState::Open);
                        assert!(usage.users.contains_key(&10));
                    }
                    .boxed()
                }),
            );
            skip_to_end(&mut usage, id).unwrap()
        };

        wait_for_completion(completion).await;
    }
}
