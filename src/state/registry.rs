use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::{MultiplayerError, MultiplayerResult},
    state::room::{Room, RoomId, RoomState},
};

/// Process-wide directory of active rooms.
///
/// Each room sits behind its own `tokio::sync::Mutex`, which queues waiters
/// in FIFO order, so contended acquisitions are served fairly. The map
/// itself is only locked for the short lookup; the per-room lock is the
/// single-writer guard.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Mutex<Room>>>,
}

/// Scoped exclusive lease on one room.
///
/// All room mutation happens through a usage; dropping it releases the room
/// on every exit path. Code holding a usage must never await anything that
/// needs a usage of the same room.
#[derive(Debug)]
pub struct RoomUsage {
    guard: OwnedMutexGuard<Room>,
}

impl Deref for RoomUsage {
    type Target = Room;

    fn deref(&self) -> &Room {
        &self.guard
    }
}

impl DerefMut for RoomUsage {
    fn deref_mut(&mut self) -> &mut Room {
        &mut self.guard
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive usage of an existing room.
    ///
    /// Fails with `NotFound` when the room is not tracked, or was torn down
    /// while this caller was waiting for the lock.
    pub async fn get_for_use(&self, room_id: RoomId) -> MultiplayerResult<RoomUsage> {
        let cell = self
            .rooms
            .get(&room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MultiplayerError::not_found(format!("room {room_id} is not active")))?;

        let guard = cell.lock_owned().await;
        if guard.state == RoomState::Closed {
            return Err(MultiplayerError::not_found(format!(
                "room {room_id} has ended"
            )));
        }
        Ok(RoomUsage { guard })
    }

    /// Insert a freshly loaded room and acquire its usage, or acquire the
    /// existing one when another caller won the creation race.
    pub async fn create_or_acquire(&self, room: Room) -> MultiplayerResult<RoomUsage> {
        let room_id = room.id();
        let cell = self
            .rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(room)))
            .clone();

        let guard = cell.lock_owned().await;
        if guard.state == RoomState::Closed {
            return Err(MultiplayerError::not_found(format!(
                "room {room_id} has ended"
            )));
        }
        Ok(RoomUsage { guard })
    }

    /// Drop a room from the directory. The caller is expected to hold the
    /// usage and to have closed the room first; late waiters observe the
    /// closed state and fail with `NotFound`.
    pub fn remove(&self, room_id: RoomId) {
        self.rooms.remove(&room_id);
    }

    pub fn contains(&self, room_id: RoomId) -> bool {
        self.rooms.contains_key(&room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn active_room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::state::room::test_room;

    #[tokio::test]
    async fn missing_room_is_not_found() {
        let registry = RoomRegistry::new();
        let err = registry.get_for_use(7).await.unwrap_err();
        assert!(matches!(err, MultiplayerError::NotFound(_)));
    }

    #[tokio::test]
    async fn usage_is_exclusive_until_dropped() {
        let registry = Arc::new(RoomRegistry::new());
        let usage = registry.create_or_acquire(test_room(1)).await.unwrap();

        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_for_use(1).await.map(|_| ()) })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(usage);
        timeout(Duration::from_secs(1), contender)
            .await
            .expect("waiter should acquire after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_room_is_not_found_by_late_waiters() {
        let registry = Arc::new(RoomRegistry::new());
        let mut usage = registry.create_or_acquire(test_room(1)).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_for_use(1).await.map(|_| ()) })
        };
        sleep(Duration::from_millis(20)).await;

        usage.close();
        registry.remove(1);
        drop(usage);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MultiplayerError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_or_acquire_is_idempotent_under_races() {
        let registry = RoomRegistry::new();
        {
            let mut usage = registry.create_or_acquire(test_room(1)).await.unwrap();
            usage.join_user(10, None).unwrap();
        }

        // A second creation attempt must land on the existing room.
        let usage = registry.create_or_acquire(test_room(1)).await.unwrap();
        assert!(usage.users.contains_key(&10));
    }
}
