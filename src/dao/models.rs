use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Persisted multiplayer room record.
///
/// The web frontend creates the record ahead of time; this server stamps the
/// lifecycle markers as users arrive and leave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: u64,
    pub name: String,
    pub password: String,
    pub host_user_id: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

/// Persisted mirror of a single playlist item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItemRecord {
    pub id: u64,
    pub owner_id: i64,
    pub beatmap_id: u64,
    pub beatmap_checksum: String,
    pub ruleset_id: u32,
    pub allowed_mods: Vec<String>,
    pub required_mods: Vec<String>,
    pub expired: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub played_at: Option<OffsetDateTime>,
}

/// Online identity of a score, resolved from a score token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SoloScoreRecord {
    pub id: u64,
    pub passed: bool,
}

/// Batch of beatmap set changes drained from the processing queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct BeatmapSetUpdates {
    pub last_processed_queue_id: u32,
    pub beatmap_set_ids: Vec<u64>,
}
