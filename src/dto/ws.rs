use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dao::models::BeatmapSetUpdates,
    dto::{
        room::{PlaylistItemInput, RoomSettingsPatch},
        score::{FrameBundle, ScoreInfo, SpectatedUserState},
        validation::validate_mod_acronyms,
    },
    error::MultiplayerError,
    state::{
        countdown::CountdownId,
        match_type::{MatchRole, StandingEntry},
        room::{PlaylistItem, PlaylistItemId, RoomSettings, RoomState, UserId, UserState},
    },
};

/// Envelope for every client request: a correlation id plus the command.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ClientMessage {
    /// Correlation id echoed back in the reply.
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientMessage {
    /// Parse and validate a request received over the socket.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let message: Self = serde_json::from_str(raw)?;
        Ok(message)
    }
}

/// Commands accepted from connected clients.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// First message of every connection, binding it to a user.
    Identify {
        user_id: UserId,
    },
    JoinRoom {
        room_id: u64,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        ruleset_id: Option<u32>,
    },
    LeaveRoom,
    ChangeSettings {
        settings: RoomSettingsPatch,
    },
    ChangeState {
        state: UserState,
    },
    StartMatch,
    AddPlaylistItem {
        item: PlaylistItemInput,
    },
    EditPlaylistItem {
        item_id: PlaylistItemId,
        item: PlaylistItemInput,
    },
    RemovePlaylistItem {
        item_id: PlaylistItemId,
    },
    TransferHost {
        user_id: UserId,
    },
    KickUser {
        user_id: UserId,
    },
    SendMatchRequest {
        request: MatchRequest,
    },
    BeginPlaySession {
        score_token: u64,
        info: ScoreInfo,
    },
    SendFrameData {
        bundle: FrameBundle,
    },
    EndPlaySession {
        state: SpectatedUserState,
    },
}

/// Match requests routed through the hub: team moves go to the match-type
/// strategy, countdown control to the countdown manager.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRequest {
    ChangeTeam { team_id: u32 },
    /// Host-only: arm the match-start countdown.
    StartMatchCountdown { seconds: u64 },
    /// Host-only: disarm the match-start countdown.
    StopMatchCountdown,
    /// Host-only: fire the match-start countdown immediately.
    SkipMatchCountdown,
}

/// Failure payload carried in a reply envelope.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl From<&MultiplayerError> for WireError {
    fn from(err: &MultiplayerError) -> Self {
        Self {
            code: err.wire_code(),
            message: err.to_string(),
        }
    }
}

/// Reply to one client request, correlated by id.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Reply {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn ok(id: u64, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            data,
            error: None,
        }
    }

    pub fn err(id: u64, error: &MultiplayerError) -> Self {
        Self {
            id,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Dispatched payload pushed to connected clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServerEvent {
    /// Event type name.
    pub event: String,
    /// The serialized payload for the event.
    pub data: serde_json::Value,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the data field.
    pub fn json<T: Serialize>(event: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(payload)?,
        })
    }
}

/// Validate the mod lists of a playlist item input.
pub fn validate_playlist_item_input(input: &PlaylistItemInput) -> Result<(), MultiplayerError> {
    validate_mod_acronyms(&input.allowed_mods)
        .and_then(|_| validate_mod_acronyms(&input.required_mods))
        .map_err(|err| {
            MultiplayerError::invalid_state(
                err.message
                    .as_deref()
                    .unwrap_or("invalid mod acronym")
                    .to_string(),
            )
        })
}

// Event payloads fanned out by the hub.

#[derive(Debug, Serialize, ToSchema)]
pub struct UserJoinedEvent {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserLeftEvent {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserKickedEvent {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HostChangedEvent {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserStateChangedEvent {
    pub user_id: UserId,
    pub state: UserState,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MatchRoleChangedEvent {
    pub user_id: UserId,
    pub role: MatchRole,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RoomStateChangedEvent {
    pub state: RoomState,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SettingsChangedEvent {
    pub settings: RoomSettings,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaylistItemAddedEvent {
    pub item: PlaylistItem,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaylistItemRemovedEvent {
    pub item_id: PlaylistItemId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaylistItemChangedEvent {
    pub item: PlaylistItem,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CurrentItemChangedEvent {
    pub item_id: PlaylistItemId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CountdownStartedEvent {
    pub id: CountdownId,
    pub kind: crate::state::countdown::CountdownKind,
    pub time_remaining_ms: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CountdownStoppedEvent {
    pub id: CountdownId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoadRequestedEvent {
    pub playlist_item_id: PlaylistItemId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GameplayStartedEvent {
    pub playlist_item_id: PlaylistItemId,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResultsReadyEvent {
    pub standings: Vec<StandingEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserBeganPlayingEvent {
    pub user_id: UserId,
    pub score_token: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserFinishedPlayingEvent {
    pub user_id: UserId,
    pub state: SpectatedUserState,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BeatmapSetsUpdatedEvent {
    pub updates: BeatmapSetUpdates,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_from_tagged_json() {
        let message = ClientMessage::from_json_str(
            r#"{"id": 3, "type": "join_room", "room_id": 7, "password": "sekrit"}"#,
        )
        .unwrap();

        assert_eq!(message.id, 3);
        match message.request {
            ClientRequest::JoinRoom {
                room_id, password, ..
            } => {
                assert_eq!(room_id, 7);
                assert_eq!(password.as_deref(), Some("sekrit"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_request_type_is_an_error() {
        assert!(ClientMessage::from_json_str(r#"{"id": 1, "type": "no_such_command"}"#).is_err());
    }

    #[test]
    fn replies_serialize_without_null_fields() {
        let reply = Reply::ok(9, None);
        let raw = serde_json::to_string(&reply).unwrap();
        assert_eq!(raw, r#"{"id":9}"#);

        let err = Reply::err(9, &MultiplayerError::ServerShuttingDown);
        let raw = serde_json::to_string(&err).unwrap();
        assert!(raw.contains("\"code\":4010"));
    }
}
