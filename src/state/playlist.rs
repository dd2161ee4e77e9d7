//! The per-room playlist queue: validation, authority rules, and the
//! queue-mode advancement policy.

use time::OffsetDateTime;
use tracing::warn;

use crate::{
    dao::database::{DatabaseAccess, read_with_retry},
    dto::room::PlaylistItemInput,
    error::{MultiplayerError, MultiplayerResult},
    state::room::{
        MAX_LEGACY_RULESET_ID, PlaylistItem, PlaylistItemId, QueueMode, Room, RoomEvent, UserId,
    },
};

/// Validate and append a new playlist item on behalf of `user_id`.
pub async fn add_item(
    database: &dyn DatabaseAccess,
    room: &mut Room,
    user_id: UserId,
    input: PlaylistItemInput,
) -> MultiplayerResult<PlaylistItem> {
    if room.settings.queue_mode == QueueMode::HostOnly {
        room.require_host(user_id)?;
    }

    let ruleset_id = validate_ruleset(input.ruleset_id)?;
    validate_checksum(database, input.beatmap_id, &input.beatmap_checksum).await?;

    let item = PlaylistItem {
        id: room.allocate_playlist_item_id(),
        owner_id: user_id,
        beatmap_id: input.beatmap_id,
        beatmap_checksum: input.beatmap_checksum,
        ruleset_id,
        allowed_mods: input.allowed_mods,
        required_mods: input.required_mods,
        expired: false,
        played_at: None,
    };

    database.add_playlist_item(room.id(), item.to_record()).await?;

    let had_current = room.current_item().is_some();
    room.playlist.push(item.clone());
    room.push_event(RoomEvent::PlaylistItemAdded { item: item.clone() });

    if !had_current {
        room.settings.playlist_item_id = item.id;
        room.push_event(RoomEvent::CurrentItemChanged { item_id: item.id });
    }

    Ok(item)
}

/// Remove an item. The current item, expired items, and items owned by
/// someone else (unless the caller hosts the room) are protected.
pub async fn remove_item(
    database: &dyn DatabaseAccess,
    room: &mut Room,
    user_id: UserId,
    item_id: PlaylistItemId,
) -> MultiplayerResult<()> {
    let item = require_mutable_item(room, user_id, item_id, false)?;
    let item_id = item.id;

    database.remove_playlist_item(room.id(), item_id).await?;
    room.playlist.retain(|item| item.id != item_id);
    room.push_event(RoomEvent::PlaylistItemRemoved { item_id });
    Ok(())
}

/// Replace the beatmap of an existing item, under the same authority rules
/// as removal.
pub async fn edit_item(
    database: &dyn DatabaseAccess,
    room: &mut Room,
    user_id: UserId,
    item_id: PlaylistItemId,
    input: PlaylistItemInput,
) -> MultiplayerResult<PlaylistItem> {
    require_mutable_item(room, user_id, item_id, true)?;
    let ruleset_id = validate_ruleset(input.ruleset_id)?;
    validate_checksum(database, input.beatmap_id, &input.beatmap_checksum).await?;

    let room_id = room.id();
    let item = room
        .playlist
        .iter_mut()
        .find(|item| item.id == item_id)
        .ok_or_else(|| MultiplayerError::invalid_state("the item is gone"))?;
    item.beatmap_id = input.beatmap_id;
    item.beatmap_checksum = input.beatmap_checksum;
    item.ruleset_id = ruleset_id;
    item.allowed_mods = input.allowed_mods;
    item.required_mods = input.required_mods;
    let updated = item.clone();

    database
        .update_playlist_item(room_id, updated.to_record())
        .await?;
    room.push_event(RoomEvent::PlaylistItemChanged {
        item: updated.clone(),
    });
    Ok(updated)
}

/// Expire the current item after a completed round and advance the pointer
/// according to the queue mode. Database failures here are logged and
/// swallowed so the room keeps moving.
pub async fn finish_current_item(database: &dyn DatabaseAccess, room: &mut Room) {
    let room_id = room.id();
    let Some(item) = room.current_item_mut() else {
        return;
    };

    item.expired = true;
    item.played_at = Some(OffsetDateTime::now_utc());
    let expired = item.clone();
    room.push_event(RoomEvent::PlaylistItemChanged {
        item: expired.clone(),
    });
    if let Err(err) = database
        .update_playlist_item(room_id, expired.to_record())
        .await
    {
        warn!(room_id, item_id = expired.id, error = %err, "failed to mirror item expiry");
    }

    let next_id = match select_next_item(room) {
        Some(id) => id,
        // The queue ran dry; requeue the just-played beatmap so the room
        // always has a current item.
        None => {
            let requeued = PlaylistItem {
                id: room.allocate_playlist_item_id(),
                expired: false,
                played_at: None,
                ..expired
            };
            if let Err(err) = database
                .add_playlist_item(room_id, requeued.to_record())
                .await
            {
                warn!(room_id, item_id = requeued.id, error = %err, "failed to mirror requeued item");
            }
            let id = requeued.id;
            room.playlist.push(requeued.clone());
            room.push_event(RoomEvent::PlaylistItemAdded { item: requeued });
            id
        }
    };

    room.settings.playlist_item_id = next_id;
    room.push_event(RoomEvent::CurrentItemChanged { item_id: next_id });
}

/// Re-derive the current item pointer, used after a queue mode change.
pub fn refresh_current_item(room: &mut Room) {
    if let Some(next_id) = select_next_item(room) {
        if next_id != room.settings.playlist_item_id {
            room.settings.playlist_item_id = next_id;
            room.push_event(RoomEvent::CurrentItemChanged { item_id: next_id });
        }
    }
}

/// Pick the next unexpired item id under the room's queue mode, if any.
fn select_next_item(room: &Room) -> Option<PlaylistItemId> {
    let unexpired: Vec<&PlaylistItem> =
        room.playlist.iter().filter(|item| !item.expired).collect();
    if unexpired.is_empty() {
        return None;
    }

    match room.settings.queue_mode {
        // Enqueue order.
        QueueMode::AllPlayers => unexpired.iter().map(|item| item.id).min(),
        // Host-authored items first, falling back to anything playable.
        QueueMode::HostOnly => {
            let host = room.host_user_id;
            unexpired
                .iter()
                .filter(|item| Some(item.owner_id) == host)
                .map(|item| item.id)
                .min()
                .or_else(|| unexpired.iter().map(|item| item.id).min())
        }
        // The owner with the fewest played items goes next.
        QueueMode::AllPlayersRoundRobin => unexpired
            .iter()
            .min_by_key(|item| (played_count(room, item.owner_id), item.id))
            .map(|item| item.id),
    }
}

fn played_count(room: &Room, owner_id: UserId) -> usize {
    room.playlist
        .iter()
        .filter(|item| item.owner_id == owner_id && item.expired)
        .count()
}

/// Shared protection rules for removal and editing. Editing the current
/// item stays possible for its own author; removing it never is.
fn require_mutable_item<'a>(
    room: &'a Room,
    user_id: UserId,
    item_id: PlaylistItemId,
    allow_current_for_owner: bool,
) -> MultiplayerResult<&'a PlaylistItem> {
    let Some(item) = room.playlist.iter().find(|item| item.id == item_id) else {
        return Err(MultiplayerError::invalid_state(format!(
            "item {item_id} does not belong to room {}",
            room.id()
        )));
    };
    if item.id == room.settings.playlist_item_id
        && !item.expired
        && !(allow_current_for_owner && item.owner_id == user_id)
    {
        return Err(MultiplayerError::invalid_state(
            "the current item cannot be changed",
        ));
    }
    if item.expired {
        return Err(MultiplayerError::invalid_state(
            "expired items cannot be changed",
        ));
    }
    if item.owner_id != user_id && room.host_user_id != Some(user_id) {
        return Err(MultiplayerError::invalid_state(format!(
            "item {item_id} belongs to user {}",
            item.owner_id
        )));
    }
    Ok(item)
}

fn validate_ruleset(ruleset_id: i32) -> MultiplayerResult<u32> {
    if !(0..=MAX_LEGACY_RULESET_ID as i32).contains(&ruleset_id) {
        return Err(MultiplayerError::invalid_state(format!(
            "ruleset {ruleset_id} cannot be played in multiplayer"
        )));
    }
    Ok(ruleset_id as u32)
}

async fn validate_checksum(
    database: &dyn DatabaseAccess,
    beatmap_id: u64,
    checksum: &str,
) -> MultiplayerResult<()> {
    let known = read_with_retry(|| database.get_beatmap_checksum(beatmap_id)).await?;
    match known {
        Some(expected) if expected == checksum => Ok(()),
        Some(_) => Err(MultiplayerError::invalid_state(format!(
            "checksum mismatch for beatmap {beatmap_id}"
        ))),
        None => Err(MultiplayerError::invalid_state(format!(
            "beatmap {beatmap_id} is unknown"
        ))),
    }
}
