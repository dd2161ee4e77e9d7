use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::{
    dao::models::{PlaylistItemRecord, RoomRecord},
    error::{MultiplayerError, MultiplayerResult},
    state::{
        countdown::{ActiveCountdown, CountdownId, CountdownKind},
        match_type::{MatchRole, StandingEntry, assign_role_on_join},
    },
};

pub type RoomId = u64;
pub type UserId = i64;
pub type PlaylistItemId = u64;

/// Highest ruleset id playable in multiplayer; custom rulesets are rejected.
pub const MAX_LEGACY_RULESET_ID: u32 = 3;

/// Aggregate state of a room, derived from its users' states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Open,
    WaitingForLoad,
    Playing,
    Closed,
}

/// Per-user state inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Idle,
    Ready,
    WaitingForLoad,
    Loaded,
    ReadyForGameplay,
    Playing,
    FinishedPlay,
    Results,
    Spectating,
}

impl UserState {
    /// States a client may request directly; the rest are assigned by the
    /// server during the gameplay cycle.
    pub fn is_client_requestable(self) -> bool {
        matches!(
            self,
            UserState::Idle
                | UserState::Ready
                | UserState::Loaded
                | UserState::ReadyForGameplay
                | UserState::FinishedPlay
                | UserState::Spectating
        )
    }

    /// Membership in the gameplay subgroup: the users currently inside the
    /// load/play phase who receive gameplay-scoped fan-outs.
    pub fn is_gameplay(self) -> bool {
        matches!(
            self,
            UserState::WaitingForLoad
                | UserState::Loaded
                | UserState::ReadyForGameplay
                | UserState::Playing
        )
    }

    /// Whether the user has finished loading and is waiting for the
    /// synchronized gameplay start.
    pub fn is_done_loading(self) -> bool {
        matches!(self, UserState::Loaded | UserState::ReadyForGameplay)
    }
}

/// Ruleset governing how users compete against each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    HeadToHead,
    TeamVersus,
}

/// Policy governing who may add playlist items and in what order they play.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    #[default]
    HostOnly,
    AllPlayers,
    AllPlayersRoundRobin,
}

/// Host-adjustable room settings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RoomSettings {
    pub name: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub match_type: MatchType,
    pub queue_mode: QueueMode,
    /// Id of the current playlist item.
    pub playlist_item_id: PlaylistItemId,
}

/// One entry of the room's playlist.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlaylistItem {
    pub id: PlaylistItemId,
    pub owner_id: UserId,
    pub beatmap_id: u64,
    pub beatmap_checksum: String,
    pub ruleset_id: u32,
    pub allowed_mods: Vec<String>,
    pub required_mods: Vec<String>,
    pub expired: bool,
    #[serde(skip)]
    pub played_at: Option<OffsetDateTime>,
}

impl PlaylistItem {
    pub fn to_record(&self) -> PlaylistItemRecord {
        PlaylistItemRecord {
            id: self.id,
            owner_id: self.owner_id,
            beatmap_id: self.beatmap_id,
            beatmap_checksum: self.beatmap_checksum.clone(),
            ruleset_id: self.ruleset_id,
            allowed_mods: self.allowed_mods.clone(),
            required_mods: self.required_mods.clone(),
            expired: self.expired,
            played_at: self.played_at,
        }
    }

    pub fn from_record(record: PlaylistItemRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id,
            beatmap_id: record.beatmap_id,
            beatmap_checksum: record.beatmap_checksum,
            ruleset_id: record.ruleset_id,
            allowed_mods: record.allowed_mods,
            required_mods: record.required_mods,
            expired: record.expired,
            played_at: record.played_at,
        }
    }
}

/// A user present in a room.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomUser {
    pub user_id: UserId,
    pub state: UserState,
    /// Preferred ruleset announced at join time, if any.
    pub ruleset_id: Option<u32>,
    /// Role data owned by the active match-type strategy.
    pub match_role: MatchRole,
}

/// Which connections an emitted event should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every user currently in the room.
    Room,
    /// Only the users inside the load/play phase.
    GameplayGroup,
}

/// Change notifications buffered on the room while a usage is held; the hub
/// drains and fans them out before releasing the usage.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    UserJoined { user_id: UserId },
    UserLeft { user_id: UserId },
    UserKicked { user_id: UserId },
    HostChanged { user_id: UserId },
    UserStateChanged { user_id: UserId, state: UserState },
    MatchRoleChanged { user_id: UserId, role: MatchRole },
    RoomStateChanged { state: RoomState },
    SettingsChanged { settings: RoomSettings },
    PlaylistItemAdded { item: PlaylistItem },
    PlaylistItemRemoved { item_id: PlaylistItemId },
    PlaylistItemChanged { item: PlaylistItem },
    CurrentItemChanged { item_id: PlaylistItemId },
    CountdownStarted {
        id: CountdownId,
        kind: CountdownKind,
        remaining_ms: u64,
    },
    CountdownStopped { id: CountdownId },
    LoadRequested,
    GameplayStarted,
    ResultsReady { standings: Vec<StandingEntry> },
}

impl RoomEvent {
    pub fn audience(&self) -> Audience {
        match self {
            RoomEvent::LoadRequested | RoomEvent::GameplayStarted => Audience::GameplayGroup,
            _ => Audience::Room,
        }
    }
}

/// A multiplayer room: the user set, playlist, countdowns and settings,
/// always mutated under a registry usage.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    pub state: RoomState,
    pub settings: RoomSettings,
    pub users: IndexMap<UserId, RoomUser>,
    pub playlist: Vec<PlaylistItem>,
    pub host_user_id: Option<UserId>,
    pub(crate) countdowns: Vec<ActiveCountdown>,
    next_playlist_item_id: PlaylistItemId,
    next_countdown_id: CountdownId,
    /// Set when a gameplay round completed and the current item must be
    /// expired; consumed by the hub while the usage is still held.
    pub(crate) round_completed: bool,
    events: Vec<RoomEvent>,
}

impl Room {
    /// Materialize a room from its persisted record and playlist mirror.
    pub fn from_record(record: &RoomRecord, items: Vec<PlaylistItemRecord>) -> Self {
        let playlist: Vec<PlaylistItem> =
            items.into_iter().map(PlaylistItem::from_record).collect();
        let next_playlist_item_id = playlist.iter().map(|item| item.id + 1).max().unwrap_or(1);
        let current = playlist
            .iter()
            .find(|item| !item.expired)
            .map(|item| item.id)
            .unwrap_or_default();

        Self {
            id: record.room_id,
            state: RoomState::Open,
            settings: RoomSettings {
                name: record.name.clone(),
                password: record.password.clone(),
                match_type: MatchType::default(),
                queue_mode: QueueMode::default(),
                playlist_item_id: current,
            },
            users: IndexMap::new(),
            playlist,
            host_user_id: None,
            countdowns: Vec::new(),
            next_playlist_item_id,
            next_countdown_id: 1,
            round_completed: false,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Record an event for the hub to fan out before the usage drops.
    pub(crate) fn push_event(&mut self, event: RoomEvent) {
        self.events.push(event);
    }

    /// Drain the buffered change notifications.
    pub fn take_events(&mut self) -> Vec<RoomEvent> {
        std::mem::take(&mut self.events)
    }

    /// Users currently inside the load/play phase.
    pub fn gameplay_user_ids(&self) -> Vec<UserId> {
        self.users
            .values()
            .filter(|user| user.state.is_gameplay())
            .map(|user| user.user_id)
            .collect()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.users.keys().copied().collect()
    }

    pub fn current_item(&self) -> Option<&PlaylistItem> {
        self.playlist
            .iter()
            .find(|item| item.id == self.settings.playlist_item_id && !item.expired)
    }

    pub(crate) fn current_item_mut(&mut self) -> Option<&mut PlaylistItem> {
        let current_id = self.settings.playlist_item_id;
        self.playlist
            .iter_mut()
            .find(|item| item.id == current_id && !item.expired)
    }

    pub(crate) fn allocate_playlist_item_id(&mut self) -> PlaylistItemId {
        let id = self.next_playlist_item_id;
        self.next_playlist_item_id += 1;
        id
    }

    pub(crate) fn allocate_countdown_id(&mut self) -> CountdownId {
        let id = self.next_countdown_id;
        self.next_countdown_id += 1;
        id
    }

    /// Add a user to the room. The first joiner becomes host.
    pub fn join_user(&mut self, user_id: UserId, ruleset_id: Option<u32>) -> MultiplayerResult<()> {
        if self.state == RoomState::Closed {
            return Err(MultiplayerError::not_found(format!(
                "room {} has ended",
                self.id
            )));
        }
        if self.users.contains_key(&user_id) {
            return Err(MultiplayerError::invalid_state(format!(
                "user {user_id} is already in room {}",
                self.id
            )));
        }

        let match_role = assign_role_on_join(self);
        self.users.insert(
            user_id,
            RoomUser {
                user_id,
                state: UserState::Idle,
                ruleset_id,
                match_role,
            },
        );
        self.push_event(RoomEvent::UserJoined { user_id });

        if self.host_user_id.is_none() {
            self.host_user_id = Some(user_id);
            self.push_event(RoomEvent::HostChanged { user_id });
        }

        Ok(())
    }

    /// Remove a user, modeling a leave or disconnect as an implicit
    /// transition to idle followed by removal. Returns `true` when the room
    /// is now empty.
    pub fn remove_user(&mut self, user_id: UserId) -> MultiplayerResult<bool> {
        if !self.users.contains_key(&user_id) {
            return Err(MultiplayerError::not_found(format!(
                "user {user_id} is not in room {}",
                self.id
            )));
        }

        self.apply_user_state(user_id, UserState::Idle);
        self.users.shift_remove(&user_id);
        self.push_event(RoomEvent::UserLeft { user_id });

        if self.host_user_id == Some(user_id) {
            self.host_user_id = self.users.keys().next().copied();
            if let Some(next_host) = self.host_user_id {
                self.push_event(RoomEvent::HostChanged { user_id: next_host });
            }
        }

        // The departure may have been the last thing holding up a
        // synchronized start or a results transition.
        self.try_begin_gameplay();
        self.check_round_completion();
        self.recompute_state();
        Ok(self.users.is_empty())
    }

    /// Transfer host authority. Only the current host may do this.
    pub fn set_host(&mut self, by: UserId, target: UserId) -> MultiplayerResult<()> {
        self.require_host(by)?;
        if !self.users.contains_key(&target) {
            return Err(MultiplayerError::not_found(format!(
                "user {target} is not in room {}",
                self.id
            )));
        }
        if self.host_user_id == Some(target) {
            return Ok(());
        }
        self.host_user_id = Some(target);
        self.push_event(RoomEvent::HostChanged { user_id: target });
        Ok(())
    }

    /// Remove another user on behalf of the host.
    pub fn kick_user(&mut self, by: UserId, target: UserId) -> MultiplayerResult<bool> {
        self.require_host(by)?;
        if by == target {
            return Err(MultiplayerError::invalid_state(
                "the host cannot kick themselves",
            ));
        }
        if !self.users.contains_key(&target) {
            return Err(MultiplayerError::not_found(format!(
                "user {target} is not in room {}",
                self.id
            )));
        }
        self.push_event(RoomEvent::UserKicked { user_id: target });
        self.remove_user(target)
    }

    pub fn require_host(&self, user_id: UserId) -> MultiplayerResult<()> {
        if self.host_user_id != Some(user_id) {
            return Err(MultiplayerError::not_authorized(format!(
                "user {user_id} is not the host of room {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Close the room for teardown: stops every countdown and freezes state.
    pub fn close(&mut self) {
        let ids: Vec<CountdownId> = self.countdowns.iter().map(|c| c.id).collect();
        for id in ids {
            self.stop_countdown_by_id(id);
        }
        if self.state != RoomState::Closed {
            self.state = RoomState::Closed;
            self.push_event(RoomEvent::RoomStateChanged {
                state: RoomState::Closed,
            });
        }
    }

    /// Register a started countdown, displacing any of the same kind.
    pub(crate) fn push_countdown(&mut self, countdown: ActiveCountdown) {
        self.stop_countdowns_of_kind(countdown.kind());
        self.push_event(RoomEvent::CountdownStarted {
            id: countdown.id,
            kind: countdown.kind(),
            remaining_ms: countdown.time_remaining().as_millis() as u64,
        });
        self.countdowns.push(countdown);
    }

    /// Stop and remove every active countdown of the given kind.
    pub fn stop_countdowns_of_kind(&mut self, kind: CountdownKind) {
        let ids: Vec<CountdownId> = self
            .countdowns
            .iter()
            .filter(|c| c.kind() == kind)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.stop_countdown_by_id(id);
        }
    }

    /// Stop and remove one countdown, signaling its delay task.
    pub fn stop_countdown_by_id(&mut self, id: CountdownId) {
        if let Some(position) = self.countdowns.iter().position(|c| c.id == id) {
            let countdown = self.countdowns.remove(position);
            countdown.signal_stop();
            self.push_event(RoomEvent::CountdownStopped { id });
        }
    }

    /// Detach a countdown on completion without signaling stop; used by the
    /// delay task itself. Returns `None` when the countdown was already
    /// stopped, in which case the completion callback must not run.
    pub(crate) fn take_countdown(&mut self, id: CountdownId) -> Option<ActiveCountdown> {
        let position = self.countdowns.iter().position(|c| c.id == id)?;
        let countdown = self.countdowns.remove(position);
        self.push_event(RoomEvent::CountdownStopped { id });
        Some(countdown)
    }

    pub fn countdown_of_kind(&self, kind: CountdownKind) -> Option<&ActiveCountdown> {
        self.countdowns.iter().find(|c| c.kind() == kind)
    }

    /// Set a user's state directly, bypassing client-request validation,
    /// and run the aggregate bookkeeping that follows any state movement.
    pub(crate) fn apply_user_state(&mut self, user_id: UserId, state: UserState) {
        let Some(user) = self.users.get_mut(&user_id) else {
            return;
        };
        if user.state == state {
            return;
        }
        user.state = state;
        self.push_event(RoomEvent::UserStateChanged { user_id, state });
    }

    /// Derive the aggregate room state from the user states.
    pub(crate) fn recompute_state(&mut self) {
        if self.state == RoomState::Closed {
            return;
        }

        let any_loaded_or_playing = self.users.values().any(|user| {
            matches!(
                user.state,
                UserState::Loaded | UserState::ReadyForGameplay | UserState::Playing
            )
        });
        let any_waiting = self
            .users
            .values()
            .any(|user| user.state == UserState::WaitingForLoad);

        let next = if any_loaded_or_playing {
            RoomState::Playing
        } else if any_waiting {
            RoomState::WaitingForLoad
        } else {
            RoomState::Open
        };

        if next != self.state {
            self.state = next;
            self.push_event(RoomEvent::RoomStateChanged { state: next });
            if next == RoomState::Open {
                // The load phase is over; a pending force-start is moot.
                self.stop_countdowns_of_kind(CountdownKind::ForceGameplayStart);
            }
        }
    }

    /// When no user remains inside the load/play phase and at least one has
    /// finished, move the finishers to results and flag the round complete.
    pub(crate) fn check_round_completion(&mut self) {
        let any_in_gameplay = self.users.values().any(|user| user.state.is_gameplay());
        if any_in_gameplay {
            return;
        }

        let finished: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.state == UserState::FinishedPlay)
            .map(|user| user.user_id)
            .collect();
        if finished.is_empty() {
            return;
        }

        for user_id in &finished {
            self.apply_user_state(*user_id, UserState::Results);
        }
        let standings = crate::state::match_type::standings(self, &finished);
        self.round_completed = true;
        self.push_event(RoomEvent::ResultsReady { standings });
    }

    /// Consume the round-completion flag; the hub expires the current item
    /// when this returns `true`.
    pub(crate) fn take_round_completed(&mut self) -> bool {
        std::mem::take(&mut self.round_completed)
    }
}

/// Bare room for unit tests across the state modules.
#[cfg(test)]
pub(crate) fn test_room(id: RoomId) -> Room {
    let record = RoomRecord {
        room_id: id,
        name: "test room".into(),
        password: String::new(),
        host_user_id: 0,
        started_at: None,
        ended_at: None,
    };
    Room::from_record(&record, Vec::new())
}
