//! The multiplayer hub: translates client requests into room operations
//! executed under a single-writer usage, then fans out the buffered change
//! events while the usage is still held.

use std::time::Duration;

use futures::{FutureExt, future::BoxFuture};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    dao::database::read_with_retry,
    dto::{
        room::{PlaylistItemInput, RoomSettingsPatch, RoomSnapshot},
        ws::{MatchRequest, validate_playlist_item_input},
    },
    error::{MultiplayerError, MultiplayerResult},
    services::hub_events,
    state::{
        SharedState,
        countdown::{self, Countdown, CountdownKind},
        match_type, playlist,
        registry::RoomUsage,
        room::{PlaylistItemId, Room, RoomId, RoomState, UserId, UserState},
        transitions::StartInitiator,
    },
};

/// How long loading users get before gameplay is forced to start.
const FORCE_GAMEPLAY_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period given to rooms when the server begins shutting down.
const SHUTDOWN_ROOM_CLOSE_DELAY: Duration = Duration::from_secs(30);

/// Join a room, loading it from the database on first use.
pub async fn join_room(
    state: &SharedState,
    user_id: UserId,
    room_id: RoomId,
    password: Option<String>,
    ruleset_id: Option<u32>,
) -> MultiplayerResult<RoomSnapshot> {
    if state.is_shutting_down() {
        return Err(MultiplayerError::ServerShuttingDown);
    }
    if let Some(connection) = state.connections().get(&user_id) {
        if connection.room_id.is_some() {
            return Err(MultiplayerError::invalid_state(format!(
                "user {user_id} is already in a room"
            )));
        }
    }

    let mut usage = acquire_or_load(state, room_id).await?;

    let admission = check_password(&usage, password.as_deref())
        .and_then(|_| usage.join_user(user_id, ruleset_id));
    if let Err(err) = admission {
        // A failed first join must not leave an empty shell in the
        // registry.
        if usage.users.is_empty() {
            usage.close();
            state.rooms().remove(room_id);
        }
        return Err(err);
    }
    if usage.users.len() == 1 {
        let database = state.database();
        if let Err(err) = database
            .mark_room_started(room_id, OffsetDateTime::now_utc())
            .await
        {
            warn!(room_id, error = %err, "failed to stamp room start");
        }
    }

    if let Some(mut connection) = state.connections().get_mut(&user_id) {
        connection.room_id = Some(room_id);
    }
    info!(room_id, user_id, "user joined room");

    let snapshot = RoomSnapshot::capture(&usage);
    finalize_and_publish(state, &mut usage).await;
    Ok(snapshot)
}

/// Leave the current room; tears the room down when it empties.
pub async fn leave_room(state: &SharedState, user_id: UserId) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;

    let empty = usage.remove_user(user_id)?;
    if let Some(mut connection) = state.connections().get_mut(&user_id) {
        connection.room_id = None;
    }
    info!(room_id, user_id, "user left room");

    if empty {
        teardown_room(state, &mut usage).await;
    }
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Apply a host-issued settings patch while the room is idle.
pub async fn change_settings(
    state: &SharedState,
    user_id: UserId,
    patch: RoomSettingsPatch,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    usage.require_host(user_id)?;
    if usage.state != RoomState::Open {
        return Err(MultiplayerError::invalid_state(
            "settings are locked while the match is running",
        ));
    }

    let RoomSettingsPatch {
        name,
        password,
        match_type,
        queue_mode,
    } = patch;

    if let Some(name) = name {
        usage.settings.name = name;
    }
    if let Some(password) = password {
        usage.settings.password = password;
    }
    if let Some(match_type) = match_type {
        if usage.settings.match_type != match_type {
            usage.settings.match_type = match_type;
            match_type::reassign_roles(&mut usage);
        }
    }
    if let Some(queue_mode) = queue_mode {
        if usage.settings.queue_mode != queue_mode {
            usage.settings.queue_mode = queue_mode;
            playlist::refresh_current_item(&mut usage);
        }
    }

    let settings = usage.settings.clone();
    usage.push_event(crate::state::room::RoomEvent::SettingsChanged { settings });
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Apply a client-requested user state change.
pub async fn change_state(
    state: &SharedState,
    user_id: UserId,
    requested: UserState,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    usage.change_user_state(user_id, requested)?;
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Host request to start the match immediately.
pub async fn start_match(state: &SharedState, user_id: UserId) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    begin_load_phase(state, &mut usage, StartInitiator::User(user_id))?;
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Add a playlist item under the room's queue mode policy.
pub async fn add_playlist_item(
    state: &SharedState,
    user_id: UserId,
    input: PlaylistItemInput,
) -> MultiplayerResult<PlaylistItemId> {
    validate_playlist_item_input(&input)?;
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    let item = playlist::add_item(state.database().as_ref(), &mut usage, user_id, input).await?;
    finalize_and_publish(state, &mut usage).await;
    Ok(item.id)
}

/// Replace the content of a queued item.
pub async fn edit_playlist_item(
    state: &SharedState,
    user_id: UserId,
    item_id: PlaylistItemId,
    input: PlaylistItemInput,
) -> MultiplayerResult<()> {
    validate_playlist_item_input(&input)?;
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    playlist::edit_item(state.database().as_ref(), &mut usage, user_id, item_id, input).await?;
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Remove a queued item.
pub async fn remove_playlist_item(
    state: &SharedState,
    user_id: UserId,
    item_id: PlaylistItemId,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    playlist::remove_item(state.database().as_ref(), &mut usage, user_id, item_id).await?;
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Hand host authority to another user.
pub async fn transfer_host(
    state: &SharedState,
    user_id: UserId,
    target: UserId,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    usage.set_host(user_id, target)?;
    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Kick a user from the room on behalf of the host.
pub async fn kick_user(
    state: &SharedState,
    user_id: UserId,
    target: UserId,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;
    usage.kick_user(user_id, target)?;
    if let Some(mut connection) = state.connections().get_mut(&target) {
        connection.room_id = None;
    }
    info!(room_id, user_id, target, "user kicked from room");

    // The target is no longer in the room group; tell them directly.
    let kicked_event = hub_events::named_event(
        "user_kicked",
        &crate::dto::ws::UserKickedEvent { user_id: target },
    );
    if let Some(event) = kicked_event {
        hub_events::send_event_to_users(state, &[target], &event);
    }

    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Dispatch a match request: team moves go to the match-type strategy,
/// countdown control to the countdown manager.
pub async fn send_match_request(
    state: &SharedState,
    user_id: UserId,
    request: MatchRequest,
) -> MultiplayerResult<()> {
    let room_id = current_room(state, user_id)?;
    let mut usage = state.rooms().get_for_use(room_id).await?;

    match request {
        MatchRequest::ChangeTeam { team_id } => {
            match_type::change_team(&mut usage, user_id, team_id)?;
        }
        MatchRequest::StartMatchCountdown { seconds } => {
            usage.require_host(user_id)?;
            if usage.state != RoomState::Open {
                return Err(MultiplayerError::invalid_state(
                    "the match has already been started",
                ));
            }
            countdown::start_countdown(
                state,
                &mut usage,
                Countdown::MatchStart {
                    duration: Duration::from_secs(seconds),
                },
                Box::new(match_start_continuation),
            );
        }
        MatchRequest::StopMatchCountdown => {
            usage.require_host(user_id)?;
            usage.stop_countdowns_of_kind(CountdownKind::MatchStart);
        }
        MatchRequest::SkipMatchCountdown => {
            usage.require_host(user_id)?;
            let id = usage
                .countdown_of_kind(CountdownKind::MatchStart)
                .map(|c| c.id)
                .ok_or_else(|| {
                    MultiplayerError::not_found("no match start countdown is active")
                })?;
            let completion = countdown::skip_to_end(&mut usage, id)?;
            finalize_and_publish(state, &mut usage).await;
            // The completion callback re-acquires the room; awaiting it
            // while still holding this usage would deadlock.
            drop(usage);
            countdown::wait_for_completion(completion).await;
            return Ok(());
        }
    }

    finalize_and_publish(state, &mut usage).await;
    Ok(())
}

/// Reject new joins and give every room a short countdown before closing.
pub async fn initiate_graceful_shutdown(state: &SharedState) {
    state.begin_shutdown();
    info!("graceful shutdown started; closing rooms");

    for room_id in state.rooms().active_room_ids() {
        let Ok(mut usage) = state.rooms().get_for_use(room_id).await else {
            continue;
        };
        countdown::start_countdown(
            state,
            &mut usage,
            Countdown::ServerShutdown {
                duration: SHUTDOWN_ROOM_CLOSE_DELAY,
            },
            Box::new(shutdown_continuation),
        );
        finalize_and_publish(state, &mut usage).await;
    }
}

/// Run the deferred consequences of an operation and fan out the buffered
/// events, all while the usage is still held.
pub async fn finalize_and_publish(state: &SharedState, usage: &mut RoomUsage) {
    if usage.take_round_completed() {
        playlist::finish_current_item(state.database().as_ref(), &mut **usage).await;
    }
    publish_room_events(state, usage);
}

/// Fan out buffered events to the room group or the gameplay subgroup.
pub fn publish_room_events(state: &SharedState, usage: &mut RoomUsage) {
    let events = usage.take_events();
    if events.is_empty() {
        return;
    }

    let room_members = usage.user_ids();
    let gameplay_members = usage.gameplay_user_ids();

    for event in events {
        let Some(server_event) = hub_events::to_server_event(usage, &event) else {
            continue;
        };
        let targets = match event.audience() {
            crate::state::room::Audience::Room => &room_members,
            crate::state::room::Audience::GameplayGroup => &gameplay_members,
        };
        hub_events::send_event_to_users(state, targets, &server_event);
    }
}

/// Start the load phase and arm the force-start countdown.
fn begin_load_phase(
    state: &SharedState,
    usage: &mut RoomUsage,
    initiator: StartInitiator,
) -> MultiplayerResult<()> {
    usage.start_match(initiator)?;
    usage.stop_countdowns_of_kind(CountdownKind::MatchStart);
    countdown::start_countdown(
        state,
        usage,
        Countdown::ForceGameplayStart {
            duration: FORCE_GAMEPLAY_START_TIMEOUT,
        },
        Box::new(force_start_continuation),
    );
    Ok(())
}

/// Completion of the match-start countdown.
fn match_start_continuation<'a>(
    state: &'a SharedState,
    usage: &'a mut RoomUsage,
) -> BoxFuture<'a, ()> {
    async move {
        if let Err(err) = begin_load_phase(state, usage, StartInitiator::Countdown) {
            debug!(room_id = usage.id(), error = %err, "match start countdown fired with nothing to start");
        }
    }
    .boxed()
}

/// Completion of the force-gameplay-start countdown.
fn force_start_continuation<'a>(
    _state: &'a SharedState,
    usage: &'a mut RoomUsage,
) -> BoxFuture<'a, ()> {
    async move {
        usage.force_gameplay_start();
    }
    .boxed()
}

/// Completion of the shutdown countdown.
fn shutdown_continuation<'a>(
    state: &'a SharedState,
    usage: &'a mut RoomUsage,
) -> BoxFuture<'a, ()> {
    teardown_room(state, usage).boxed()
}

/// Close a room, drop it from the registry, clear its members' directory
/// entries, and stamp the end marker (best effort).
async fn teardown_room(state: &SharedState, usage: &mut RoomUsage) {
    let room_id = usage.id();
    usage.close();
    state.rooms().remove(room_id);
    for user_id in usage.user_ids() {
        if let Some(mut connection) = state.connections().get_mut(&user_id) {
            connection.room_id = None;
        }
    }
    if let Err(err) = state
        .database()
        .mark_room_ended(room_id, OffsetDateTime::now_utc())
        .await
    {
        warn!(room_id, error = %err, "failed to stamp room end");
    }
    info!(room_id, "room ended");
}

fn check_password(room: &Room, password: Option<&str>) -> MultiplayerResult<()> {
    if room.settings.password != password.unwrap_or_default() {
        return Err(MultiplayerError::not_authorized(format!(
            "wrong password for room {}",
            room.id()
        )));
    }
    Ok(())
}

/// Load a tracked room, or materialize it from the database on first join.
async fn acquire_or_load(state: &SharedState, room_id: RoomId) -> MultiplayerResult<RoomUsage> {
    match state.rooms().get_for_use(room_id).await {
        Ok(usage) => Ok(usage),
        Err(MultiplayerError::NotFound(_)) => {
            let database = state.database();
            let record = read_with_retry(|| database.get_room(room_id))
                .await?
                .ok_or_else(|| {
                    MultiplayerError::not_found(format!("room {room_id} does not exist"))
                })?;
            let items = read_with_retry(|| database.get_all_playlist_items(room_id)).await?;
            let room = Room::from_record(&record, items);
            state.rooms().create_or_acquire(room).await
        }
        Err(err) => Err(err),
    }
}

/// Room the user's connection is currently joined to.
fn current_room(state: &SharedState, user_id: UserId) -> MultiplayerResult<RoomId> {
    state
        .connections()
        .get(&user_id)
        .and_then(|connection| connection.room_id)
        .ok_or_else(|| MultiplayerError::invalid_state(format!("user {user_id} is not in a room")))
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        dao::models::RoomRecord,
        state::{TestHarness, register_test_connection, test_harness},
    };

    fn seed_room(harness: &TestHarness, room_id: RoomId, password: &str) {
        harness.database.insert_room(RoomRecord {
            room_id,
            name: "hub room".into(),
            password: password.into(),
            host_user_id: 0,
            started_at: None,
            ended_at: None,
        });
        harness.database.set_beatmap_checksum(1, "checksum-1");
        harness.database.set_beatmap_checksum(2, "checksum-2");
    }

    async fn join_all(
        harness: &TestHarness,
        room_id: RoomId,
        user_ids: &[UserId],
    ) -> Vec<mpsc::UnboundedReceiver<Message>> {
        let mut receivers = Vec::new();
        for &user_id in user_ids {
            let rx = register_test_connection(&harness.state, user_id);
            join_room(&harness.state, user_id, room_id, None, None)
                .await
                .unwrap();
            receivers.push(rx);
        }
        receivers
    }

    fn drain_event_names(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(message) = rx.try_recv() {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            if let Some(name) = value.get("event").and_then(|event| event.as_str()) {
                names.push(name.to_string());
            }
        }
        names
    }

    fn item_input(beatmap_id: u64) -> PlaylistItemInput {
        PlaylistItemInput {
            beatmap_id,
            beatmap_checksum: format!("checksum-{beatmap_id}"),
            ruleset_id: 0,
            allowed_mods: Vec::new(),
            required_mods: Vec::new(),
        }
    }

    #[tokio::test]
    async fn joining_an_unknown_room_is_not_found() {
        let harness = test_harness();
        register_test_connection(&harness.state, 10);

        let err = join_room(&harness.state, 10, 99, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplayerError::NotFound(_)));
    }

    #[tokio::test]
    async fn joining_with_the_wrong_password_is_rejected() {
        let harness = test_harness();
        seed_room(&harness, 1, "sekrit");
        register_test_connection(&harness.state, 10);

        let err = join_room(&harness.state, 10, 1, Some("nope".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplayerError::NotAuthorized(_)));

        join_room(&harness.state, 10, 1, Some("sekrit".into()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn joins_are_rejected_during_shutdown() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        register_test_connection(&harness.state, 10);

        harness.state.begin_shutdown();
        let err = join_room(&harness.state, 10, 1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplayerError::ServerShuttingDown));
    }

    #[tokio::test]
    async fn a_user_can_only_be_in_one_room() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        seed_room(&harness, 2, "");
        join_all(&harness, 1, &[10]).await;

        let err = join_room(&harness.state, 10, 2, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn last_leaver_tears_the_room_down() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        join_all(&harness, 1, &[10, 20]).await;

        leave_room(&harness.state, 10).await.unwrap();
        assert!(harness.state.rooms().contains(1));

        leave_room(&harness.state, 20).await.unwrap();
        assert!(!harness.state.rooms().contains(1));
        assert!(harness.database.room(1).unwrap().ended_at.is_some());
        assert!(harness.database.room(1).unwrap().started_at.is_some());
    }

    #[tokio::test]
    async fn load_requested_reaches_only_the_gameplay_subgroup() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        let mut receivers = join_all(&harness, 1, &[10, 20]).await;

        change_state(&harness.state, 10, UserState::Ready)
            .await
            .unwrap();
        for rx in receivers.iter_mut() {
            drain_event_names(rx);
        }

        start_match(&harness.state, 10).await.unwrap();

        let host_events = drain_event_names(&mut receivers[0]);
        let idle_events = drain_event_names(&mut receivers[1]);
        assert!(host_events.contains(&"load_requested".to_string()));
        assert!(!idle_events.contains(&"load_requested".to_string()));
        // The idle user still observes the state movements.
        assert!(idle_events.contains(&"room_state_changed".to_string()));

        let usage = harness.state.rooms().get_for_use(1).await.unwrap();
        assert_eq!(usage.users[&10].state, UserState::WaitingForLoad);
        assert_eq!(usage.users[&20].state, UserState::Idle);
        assert_eq!(usage.state, RoomState::WaitingForLoad);
    }

    #[tokio::test]
    async fn repeated_change_state_emits_no_events() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        let mut receivers = join_all(&harness, 1, &[10]).await;
        drain_event_names(&mut receivers[0]);

        change_state(&harness.state, 10, UserState::Idle)
            .await
            .unwrap();
        assert!(drain_event_names(&mut receivers[0]).is_empty());
    }

    #[tokio::test]
    async fn kicked_users_are_notified_directly() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        let mut receivers = join_all(&harness, 1, &[10, 20]).await;

        kick_user(&harness.state, 10, 20).await.unwrap();

        let kicked_events = drain_event_names(&mut receivers[1]);
        assert!(kicked_events.contains(&"user_kicked".to_string()));
        assert_eq!(
            harness
                .state
                .connections()
                .get(&20)
                .and_then(|connection| connection.room_id),
            None
        );
    }

    #[tokio::test]
    async fn snapshot_recomputes_countdown_time_remaining() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        join_all(&harness, 1, &[10]).await;

        send_match_request(
            &harness.state,
            10,
            MatchRequest::StartMatchCountdown { seconds: 3600 },
        )
        .await
        .unwrap();

        let usage = harness.state.rooms().get_for_use(1).await.unwrap();
        let snapshot = RoomSnapshot::capture(&usage);
        assert_eq!(snapshot.countdowns.len(), 1);
        let remaining = snapshot.countdowns[0].time_remaining_ms;
        assert!(remaining > 0 && remaining <= 3_600_000);
    }

    #[tokio::test]
    async fn skipping_the_start_countdown_starts_the_match() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        join_all(&harness, 1, &[10]).await;
        change_state(&harness.state, 10, UserState::Ready)
            .await
            .unwrap();

        send_match_request(
            &harness.state,
            10,
            MatchRequest::StartMatchCountdown { seconds: 3600 },
        )
        .await
        .unwrap();
        send_match_request(&harness.state, 10, MatchRequest::SkipMatchCountdown)
            .await
            .unwrap();

        let usage = harness.state.rooms().get_for_use(1).await.unwrap();
        assert_eq!(usage.state, RoomState::WaitingForLoad);
        assert_eq!(usage.users[&10].state, UserState::WaitingForLoad);
    }

    #[tokio::test]
    async fn finished_round_expires_the_current_item() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        join_all(&harness, 1, &[10]).await;

        let item_id = add_playlist_item(&harness.state, 10, item_input(1))
            .await
            .unwrap();

        change_state(&harness.state, 10, UserState::Ready)
            .await
            .unwrap();
        start_match(&harness.state, 10).await.unwrap();
        change_state(&harness.state, 10, UserState::Loaded)
            .await
            .unwrap();
        change_state(&harness.state, 10, UserState::FinishedPlay)
            .await
            .unwrap();

        let usage = harness.state.rooms().get_for_use(1).await.unwrap();
        let played = usage
            .playlist
            .iter()
            .find(|item| item.id == item_id)
            .unwrap();
        assert!(played.expired);
        assert!(played.played_at.is_some());
        // The queue was drained, so the beatmap was requeued as the new
        // current item.
        assert_ne!(usage.settings.playlist_item_id, item_id);
        assert!(usage.current_item().is_some());
        assert_eq!(usage.users[&10].state, UserState::Results);
    }

    #[tokio::test]
    async fn settings_changes_are_host_only() {
        let harness = test_harness();
        seed_room(&harness, 1, "");
        join_all(&harness, 1, &[10, 20]).await;

        let patch = RoomSettingsPatch {
            name: Some("renamed".into()),
            ..RoomSettingsPatch::default()
        };
        let err = change_settings(&harness.state, 20, patch.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MultiplayerError::NotAuthorized(_)));

        change_settings(&harness.state, 10, patch).await.unwrap();
        let usage = harness.state.rooms().get_for_use(1).await.unwrap();
        assert_eq!(usage.settings.name, "renamed");
    }
}
