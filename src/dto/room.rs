use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::{
    countdown::{CountdownId, CountdownKind},
    room::{PlaylistItem, Room, RoomId, RoomSettings, RoomState, RoomUser, UserId},
};

/// Wire input describing a playlist item to add or the replacement content
/// of an edited one.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlaylistItemInput {
    pub beatmap_id: u64,
    pub beatmap_checksum: String,
    /// Signed on the wire so out-of-range rulesets fail validation instead
    /// of deserialization.
    pub ruleset_id: i32,
    #[serde(default)]
    pub allowed_mods: Vec<String>,
    #[serde(default)]
    pub required_mods: Vec<String>,
}

/// Host-adjustable settings patch; unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RoomSettingsPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub match_type: Option<crate::state::room::MatchType>,
    #[serde(default)]
    pub queue_mode: Option<crate::state::room::QueueMode>,
}

/// Client-visible view of an active countdown. `time_remaining_ms` is
/// recomputed from the wall clock at capture time.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CountdownSnapshot {
    pub id: CountdownId,
    pub kind: CountdownKind,
    pub time_remaining_ms: u64,
}

/// Full room serialization sent to a newly joined or observing client.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub state: RoomState,
    pub settings: RoomSettings,
    pub host_user_id: Option<UserId>,
    pub users: Vec<RoomUser>,
    pub playlist: Vec<PlaylistItem>,
    pub countdowns: Vec<CountdownSnapshot>,
}

impl RoomSnapshot {
    /// Capture every visible field of the room under the caller's usage.
    pub fn capture(room: &Room) -> Self {
        Self {
            room_id: room.id(),
            state: room.state,
            settings: room.settings.clone(),
            host_user_id: room.host_user_id,
            users: room.users.values().cloned().collect(),
            playlist: room.playlist.clone(),
            countdowns: room
                .countdowns
                .iter()
                .map(|countdown| CountdownSnapshot {
                    id: countdown.id,
                    kind: countdown.kind(),
                    time_remaining_ms: countdown.time_remaining().as_millis() as u64,
                })
                .collect(),
        }
    }
}
