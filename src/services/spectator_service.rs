//! Spectator session tracking: begin/update/end of a play, capturing the
//! score token that later feeds the upload pipeline.

use tracing::{info, warn};

use crate::{
    dto::{
        score::{FrameBundle, Score, ScoreInfo, SpectatedUserState},
        ws::{UserBeganPlayingEvent, UserFinishedPlayingEvent},
    },
    error::{MultiplayerError, MultiplayerResult},
    services::hub_events::{broadcast_to_all, named_event},
    state::{SharedState, SpectatorSession, room::UserId},
};

const EVENT_USER_BEGAN_PLAYING: &str = "user_began_playing";
const EVENT_USER_FINISHED_PLAYING: &str = "user_finished_playing";

/// Open a play session for `user_id`, replacing any stale one.
pub fn begin_play_session(
    state: &SharedState,
    user_id: UserId,
    score_token: u64,
    info: ScoreInfo,
) {
    let replaced = state
        .spectators()
        .insert(
            user_id,
            SpectatorSession {
                state: SpectatedUserState::Playing,
                score_token: Some(score_token),
                score: Score::new(info),
            },
        )
        .is_some();
    if replaced {
        warn!(user_id, "previous play session replaced without an end");
    }
    info!(user_id, score_token, "play session started");

    if let Some(event) = named_event(
        EVENT_USER_BEGAN_PLAYING,
        &UserBeganPlayingEvent {
            user_id,
            score_token,
        },
    ) {
        broadcast_to_all(state, &event);
    }
}

/// Append a streamed frame batch to the in-memory replay and roll the
/// running totals forward.
pub fn receive_frame_data(
    state: &SharedState,
    user_id: UserId,
    bundle: FrameBundle,
) -> MultiplayerResult<()> {
    let Some(mut session) = state.spectators().get_mut(&user_id) else {
        return Err(MultiplayerError::invalid_state(format!(
            "user {user_id} has no active play session"
        )));
    };

    session.score.info.total_score = bundle.header.total_score;
    session.score.info.accuracy = bundle.header.accuracy;
    session.score.info.max_combo = bundle.header.max_combo;
    session.score.replay_frames.push(bundle);
    Ok(())
}

/// Close the play session and hand the captured score to the upload
/// pipeline when a token was attached.
pub async fn end_play_session(
    state: &SharedState,
    user_id: UserId,
    final_state: SpectatedUserState,
) -> MultiplayerResult<()> {
    let Some((_, session)) = state.spectators().remove(&user_id) else {
        return Err(MultiplayerError::invalid_state(format!(
            "user {user_id} has no active play session"
        )));
    };

    if let Some(token) = session.score_token {
        let mut score = session.score;
        score.info.passed = final_state == SpectatedUserState::Passed;
        state.uploader().enqueue(token, score).await;
    }
    info!(user_id, state = ?final_state, "play session ended");

    if let Some(event) = named_event(
        EVENT_USER_FINISHED_PLAYING,
        &UserFinishedPlayingEvent {
            user_id,
            state: final_state,
        },
    ) {
        broadcast_to_all(state, &event);
    }
    Ok(())
}

/// A dropped connection ends any open session as a quit.
pub async fn handle_disconnect(state: &SharedState, user_id: UserId) {
    if state.spectators().contains_key(&user_id) {
        let _ = end_play_session(state, user_id, SpectatedUserState::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::models::SoloScoreRecord,
        dto::score::{ApiUser, FrameHeader, ReplayFrame},
        state::test_harness,
    };

    fn info_for(user_id: i64) -> ScoreInfo {
        ScoreInfo::new(
            ApiUser {
                id: user_id,
                username: format!("user-{user_id}"),
            },
            0,
            77,
        )
    }

    fn bundle(total_score: u64) -> FrameBundle {
        FrameBundle {
            header: FrameHeader {
                total_score,
                accuracy: 0.97,
                combo: 12,
                max_combo: 30,
            },
            frames: vec![ReplayFrame {
                time_ms: 100,
                x: 1.0,
                y: 2.0,
                button_state: 1,
            }],
        }
    }

    #[tokio::test]
    async fn frames_accumulate_into_the_session_score() {
        let harness = test_harness();
        begin_play_session(&harness.state, 10, 1, info_for(10));

        receive_frame_data(&harness.state, 10, bundle(1000)).unwrap();
        receive_frame_data(&harness.state, 10, bundle(2500)).unwrap();

        let session = harness.state.spectators().get(&10).unwrap();
        assert_eq!(session.score.replay_frames.len(), 2);
        assert_eq!(session.score.info.total_score, 2500);
    }

    #[tokio::test]
    async fn frames_without_a_session_are_rejected() {
        let harness = test_harness();
        let err = receive_frame_data(&harness.state, 10, bundle(1)).unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn ending_a_session_uploads_the_captured_score() {
        let harness = test_harness();
        harness.state.config().set_save_replays(true);
        harness
            .database
            .set_score_for_token(5, SoloScoreRecord { id: 90, passed: true });

        begin_play_session(&harness.state, 10, 5, info_for(10));
        receive_frame_data(&harness.state, 10, bundle(4200)).unwrap();
        end_play_session(&harness.state, 10, SpectatedUserState::Passed)
            .await
            .unwrap();

        harness.state.uploader().flush().await;
        let written = harness.storage.written().await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].info.online_id, Some(90));
        assert_eq!(written[0].info.total_score, 4200);
        assert_eq!(written[0].replay_frames.len(), 1);
        assert!(harness.state.spectators().get(&10).is_none());
    }

    #[tokio::test]
    async fn disconnect_ends_the_session_as_a_quit() {
        let harness = test_harness();
        begin_play_session(&harness.state, 10, 5, info_for(10));

        handle_disconnect(&harness.state, 10).await;
        assert!(harness.state.spectators().get(&10).is_none());

        // No session, no panic.
        handle_disconnect(&harness.state, 10).await;
    }
}
