//! Periodic beatmap metadata broadcaster.
//!
//! A single-shot timer loop: poll the database for freshly processed
//! beatmap sets, fan the batch out to every connected client, then sleep.
//! The timer restarts only after a tick completes, so ticks never overlap,
//! and a failing poll never kills the loop.

use tokio::time::sleep;
use tracing::warn;

use crate::{
    dao::database::DatabaseResult,
    dto::ws::BeatmapSetsUpdatedEvent,
    services::hub_events::{broadcast_to_all, named_event},
    state::SharedState,
};

const EVENT_BEATMAP_SETS_UPDATED: &str = "beatmap_sets_updated";

/// Run the poll loop until the process exits.
pub async fn run(state: SharedState) {
    let mut last_queue_id: Option<u32> = None;

    loop {
        match tick(&state, last_queue_id).await {
            Ok(cursor) => last_queue_id = Some(cursor),
            Err(err) => warn!(error = %err, "beatmap metadata poll failed"),
        }
        sleep(state.config().metadata_poll_interval()).await;
    }
}

/// One poll: fetch changes past the cursor, advance it, and broadcast when
/// the batch is non-empty.
pub async fn tick(state: &SharedState, since: Option<u32>) -> DatabaseResult<u32> {
    let updates = state.database().get_updated_beatmap_sets(since).await?;
    let cursor = updates.last_processed_queue_id;

    if !updates.beatmap_set_ids.is_empty() {
        if let Some(event) = named_event(
            EVENT_BEATMAP_SETS_UPDATED,
            &BeatmapSetsUpdatedEvent { updates },
        ) {
            broadcast_to_all(state, &event);
        }
    }

    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{register_test_connection, test_harness};

    #[tokio::test]
    async fn cursor_advances_and_updates_fan_out() {
        let harness = test_harness();
        let mut rx = register_test_connection(&harness.state, 10);

        harness.database.push_beatmap_set_updates(&[111, 222]).await;
        let cursor = tick(&harness.state, None).await.unwrap();
        assert_eq!(cursor, 2);

        let message = rx.recv().await.expect("one broadcast");
        let text = match message {
            axum::extract::ws::Message::Text(text) => text.to_string(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert!(text.contains("beatmap_sets_updated"));
        assert!(text.contains("111"));
    }

    #[tokio::test]
    async fn empty_batches_are_not_broadcast() {
        let harness = test_harness();
        let mut rx = register_test_connection(&harness.state, 10);

        let cursor = tick(&harness.state, Some(0)).await.unwrap();
        assert_eq!(cursor, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn processed_updates_are_not_repeated() {
        let harness = test_harness();
        harness.database.push_beatmap_set_updates(&[111]).await;

        let cursor = tick(&harness.state, None).await.unwrap();
        let mut rx = register_test_connection(&harness.state, 10);
        let _ = tick(&harness.state, Some(cursor)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
