use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identity of the player attached to a score, as known by this server.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiUser {
    pub id: i64,
    pub username: String,
}

/// Score header carried alongside the replay data.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScoreInfo {
    /// Online id assigned by the database once the score token resolves.
    pub online_id: Option<u64>,
    pub passed: bool,
    pub user: ApiUser,
    pub ruleset_id: u32,
    pub beatmap_id: u64,
    pub total_score: u64,
    pub accuracy: f64,
    pub max_combo: u32,
    pub mods: Vec<String>,
}

impl ScoreInfo {
    /// Fresh header for a play session that has just begun.
    pub fn new(user: ApiUser, ruleset_id: u32, beatmap_id: u64) -> Self {
        Self {
            online_id: None,
            passed: false,
            user,
            ruleset_id,
            beatmap_id,
            total_score: 0,
            accuracy: 0.0,
            max_combo: 0,
            mods: Vec::new(),
        }
    }
}

/// A complete play: header plus the streamed replay frames.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Score {
    pub info: ScoreInfo,
    pub replay_frames: Vec<FrameBundle>,
}

impl Score {
    pub fn new(info: ScoreInfo) -> Self {
        Self {
            info,
            replay_frames: Vec::new(),
        }
    }
}

/// Running totals sent with each frame batch so spectators can render the
/// score without replaying the input stream.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FrameHeader {
    pub total_score: u64,
    pub accuracy: f64,
    pub combo: u32,
    pub max_combo: u32,
}

/// One raw input frame.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplayFrame {
    pub time_ms: i32,
    pub x: f32,
    pub y: f32,
    pub button_state: u8,
}

/// Batch of frames streamed by a playing client.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FrameBundle {
    pub header: FrameHeader,
    pub frames: Vec<ReplayFrame>,
}

/// Coarse state of a spectated play session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SpectatedUserState {
    Playing,
    Passed,
    Failed,
    Quit,
}
