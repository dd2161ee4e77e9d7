pub mod countdown;
pub mod match_type;
pub mod playlist;
pub mod registry;
pub mod room;
pub mod transitions;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    dao::{database::DatabaseAccess, storage::ScoreStorage},
    dto::score::{Score, SpectatedUserState},
    services::score_upload::ScoreUploader,
    state::{registry::RoomRegistry, room::RoomId, room::UserId},
};

pub type SharedState = Arc<AppState>;

/// Handle used to push messages to one connected client.
pub struct ClientConnection {
    pub user_id: UserId,
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<Message>,
    /// Room this connection has joined, if any. One room per user.
    pub room_id: Option<RoomId>,
}

/// In-flight play session of one spectated client.
pub struct SpectatorSession {
    pub state: SpectatedUserState,
    pub score_token: Option<u64>,
    pub score: Score,
}

/// Central application state: the room registry, the client directory,
/// spectator sessions, and the replay upload pipeline.
pub struct AppState {
    config: Arc<ServerConfig>,
    database: Arc<dyn DatabaseAccess>,
    rooms: RoomRegistry,
    connections: DashMap<UserId, ClientConnection>,
    spectators: DashMap<UserId, SpectatorSession>,
    uploader: ScoreUploader,
    shutting_down: AtomicBool,
}

impl AppState {
    /// Construct the shared state and start the upload pipeline workers.
    pub fn new(
        config: ServerConfig,
        database: Arc<dyn DatabaseAccess>,
        storage: Arc<dyn ScoreStorage>,
    ) -> SharedState {
        let config = Arc::new(config);
        let uploader = ScoreUploader::new(
            Arc::clone(&database),
            storage,
            Arc::clone(&config),
        );

        Arc::new(Self {
            config,
            database,
            rooms: RoomRegistry::new(),
            connections: DashMap::new(),
            spectators: DashMap::new(),
            uploader,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn database(&self) -> &Arc<dyn DatabaseAccess> {
        &self.database
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Directory of connected clients keyed by user id.
    pub fn connections(&self) -> &DashMap<UserId, ClientConnection> {
        &self.connections
    }

    /// Active spectator play sessions keyed by user id.
    pub fn spectators(&self) -> &DashMap<UserId, SpectatorSession> {
        &self.spectators
    }

    pub fn uploader(&self) -> &ScoreUploader {
        &self.uploader
    }

    /// Whether graceful shutdown has begun; new joins are rejected.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

/// Shared state over the in-memory ports, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_state() -> SharedState {
    test_harness().state
}

#[cfg(test)]
pub(crate) struct TestHarness {
    pub state: SharedState,
    pub database: Arc<crate::dao::memory::InMemoryDatabase>,
    pub storage: Arc<crate::dao::memory::InMemoryScoreStorage>,
}

/// Install a directory entry for `user_id` and hand back the receiving end
/// of its outbound channel, so tests can observe fan-outs.
#[cfg(test)]
pub(crate) fn register_test_connection(
    state: &SharedState,
    user_id: UserId,
) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections().insert(
        user_id,
        ClientConnection {
            user_id,
            connection_id: Uuid::new_v4(),
            tx,
            room_id: None,
        },
    );
    rx
}

#[cfg(test)]
pub(crate) fn test_harness() -> TestHarness {
    use crate::dao::memory::{InMemoryDatabase, InMemoryScoreStorage};

    let database = InMemoryDatabase::new();
    let storage = InMemoryScoreStorage::new();
    let state = AppState::new(
        ServerConfig::default(),
        database.clone() as Arc<dyn DatabaseAccess>,
        storage.clone() as Arc<dyn ScoreStorage>,
    );
    TestHarness {
        state,
        database,
        storage,
    }
}
