//! Translation of buffered room events into wire events, and the fan-out
//! primitives shared by the hub, the spectator tracker, and the metadata
//! broadcaster.

use serde::Serialize;
use tracing::warn;

use crate::{
    dto::ws::{
        CountdownStartedEvent, CountdownStoppedEvent, CurrentItemChangedEvent,
        GameplayStartedEvent, HostChangedEvent, LoadRequestedEvent, MatchRoleChangedEvent,
        PlaylistItemAddedEvent, PlaylistItemChangedEvent, PlaylistItemRemovedEvent,
        ResultsReadyEvent, RoomStateChangedEvent, ServerEvent, SettingsChangedEvent,
        UserJoinedEvent, UserKickedEvent, UserLeftEvent, UserStateChangedEvent,
    },
    services::websocket_service::send_event_to_socket,
    state::{
        SharedState,
        room::{Room, RoomEvent, UserId},
    },
};

const EVENT_USER_JOINED: &str = "user_joined";
const EVENT_USER_LEFT: &str = "user_left";
const EVENT_USER_KICKED: &str = "user_kicked";
const EVENT_HOST_CHANGED: &str = "host_changed";
const EVENT_USER_STATE_CHANGED: &str = "user_state_changed";
const EVENT_MATCH_ROLE_CHANGED: &str = "match_role_changed";
const EVENT_ROOM_STATE_CHANGED: &str = "room_state_changed";
const EVENT_SETTINGS_CHANGED: &str = "settings_changed";
const EVENT_PLAYLIST_ITEM_ADDED: &str = "playlist_item_added";
const EVENT_PLAYLIST_ITEM_REMOVED: &str = "playlist_item_removed";
const EVENT_PLAYLIST_ITEM_CHANGED: &str = "playlist_item_changed";
const EVENT_CURRENT_ITEM_CHANGED: &str = "current_item_changed";
const EVENT_COUNTDOWN_STARTED: &str = "countdown_started";
const EVENT_COUNTDOWN_STOPPED: &str = "countdown_stopped";
const EVENT_LOAD_REQUESTED: &str = "load_requested";
const EVENT_GAMEPLAY_STARTED: &str = "gameplay_started";
const EVENT_RESULTS_READY: &str = "results_ready";

/// Build the wire event for a buffered room event.
pub fn to_server_event(room: &Room, event: &RoomEvent) -> Option<ServerEvent> {
    match event {
        RoomEvent::UserJoined { user_id } => build(
            EVENT_USER_JOINED,
            &UserJoinedEvent { user_id: *user_id },
        ),
        RoomEvent::UserLeft { user_id } => {
            build(EVENT_USER_LEFT, &UserLeftEvent { user_id: *user_id })
        }
        RoomEvent::UserKicked { user_id } => build(
            EVENT_USER_KICKED,
            &UserKickedEvent { user_id: *user_id },
        ),
        RoomEvent::HostChanged { user_id } => build(
            EVENT_HOST_CHANGED,
            &HostChangedEvent { user_id: *user_id },
        ),
        RoomEvent::UserStateChanged { user_id, state } => build(
            EVENT_USER_STATE_CHANGED,
            &UserStateChangedEvent {
                user_id: *user_id,
                state: *state,
            },
        ),
        RoomEvent::MatchRoleChanged { user_id, role } => build(
            EVENT_MATCH_ROLE_CHANGED,
            &MatchRoleChangedEvent {
                user_id: *user_id,
                role: *role,
            },
        ),
        RoomEvent::RoomStateChanged { state } => build(
            EVENT_ROOM_STATE_CHANGED,
            &RoomStateChangedEvent { state: *state },
        ),
        RoomEvent::SettingsChanged { settings } => build(
            EVENT_SETTINGS_CHANGED,
            &SettingsChangedEvent {
                settings: settings.clone(),
            },
        ),
        RoomEvent::PlaylistItemAdded { item } => build(
            EVENT_PLAYLIST_ITEM_ADDED,
            &PlaylistItemAddedEvent { item: item.clone() },
        ),
        RoomEvent::PlaylistItemRemoved { item_id } => build(
            EVENT_PLAYLIST_ITEM_REMOVED,
            &PlaylistItemRemovedEvent { item_id: *item_id },
        ),
        RoomEvent::PlaylistItemChanged { item } => build(
            EVENT_PLAYLIST_ITEM_CHANGED,
            &PlaylistItemChangedEvent { item: item.clone() },
        ),
        RoomEvent::CurrentItemChanged { item_id } => build(
            EVENT_CURRENT_ITEM_CHANGED,
            &CurrentItemChangedEvent { item_id: *item_id },
        ),
        RoomEvent::CountdownStarted {
            id,
            kind,
            remaining_ms,
        } => build(
            EVENT_COUNTDOWN_STARTED,
            &CountdownStartedEvent {
                id: *id,
                kind: *kind,
                time_remaining_ms: *remaining_ms,
            },
        ),
        RoomEvent::CountdownStopped { id } => {
            build(EVENT_COUNTDOWN_STOPPED, &CountdownStoppedEvent { id: *id })
        }
        RoomEvent::LoadRequested => build(
            EVENT_LOAD_REQUESTED,
            &LoadRequestedEvent {
                playlist_item_id: room.settings.playlist_item_id,
            },
        ),
        RoomEvent::GameplayStarted => build(
            EVENT_GAMEPLAY_STARTED,
            &GameplayStartedEvent {
                playlist_item_id: room.settings.playlist_item_id,
            },
        ),
        RoomEvent::ResultsReady { standings } => build(
            EVENT_RESULTS_READY,
            &ResultsReadyEvent {
                standings: standings.clone(),
            },
        ),
    }
}

fn build<T: Serialize + std::fmt::Debug>(event: &str, payload: &T) -> Option<ServerEvent> {
    match ServerEvent::json(event, payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize event payload `{payload:?}`");
            None
        }
    }
}

/// Build a named wire event, logging serialization failures.
pub fn named_event<T: Serialize + std::fmt::Debug>(event: &str, payload: &T) -> Option<ServerEvent> {
    build(event, payload)
}

/// Push an event to a specific set of users.
pub fn send_event_to_users(state: &SharedState, user_ids: &[UserId], event: &ServerEvent) {
    for user_id in user_ids {
        if let Some(connection) = state.connections().get(user_id) {
            send_event_to_socket(&connection.tx, event);
        }
    }
}

/// Push an event to every connected client.
pub fn broadcast_to_all(state: &SharedState, event: &ServerEvent) {
    for connection in state.connections().iter() {
        send_event_to_socket(&connection.tx, event);
    }
}
