//! Per-match-type rules: role assignment on join, match requests, and
//! result aggregation.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    error::{MultiplayerError, MultiplayerResult},
    state::room::{MatchType, Room, RoomEvent, UserId},
};

/// Number of teams in a team-versus room.
const TEAM_COUNT: u32 = 2;

/// Role data owned by the active match-type strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRole {
    /// Head-to-head rooms carry no role data.
    None,
    /// Team membership in a team-versus room.
    Team { id: u32 },
}

/// One line of the aggregated results fan-out.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StandingEntry {
    pub user_id: UserId,
    pub team_id: Option<u32>,
}

/// Role handed to a user joining the room, balancing teams when the room is
/// team-versus.
pub fn assign_role_on_join(room: &Room) -> MatchRole {
    match room.settings.match_type {
        MatchType::HeadToHead => MatchRole::None,
        MatchType::TeamVersus => MatchRole::Team {
            id: smallest_team(room),
        },
    }
}

/// Re-derive every user's role after the match type changed.
pub fn reassign_roles(room: &mut Room) {
    let user_ids = room.user_ids();
    for user_id in user_ids {
        let role = match room.settings.match_type {
            MatchType::HeadToHead => MatchRole::None,
            MatchType::TeamVersus => match room.users[&user_id].match_role {
                // Users keep a valid team across the switch.
                MatchRole::Team { id } if id < TEAM_COUNT => MatchRole::Team { id },
                _ => MatchRole::Team {
                    id: smallest_team(room),
                },
            },
        };
        if room.users[&user_id].match_role != role {
            if let Some(user) = room.users.get_mut(&user_id) {
                user.match_role = role;
            }
            room.push_event(RoomEvent::MatchRoleChanged { user_id, role });
        }
    }
}

/// Move `user_id` to another team. Only valid in team-versus rooms.
pub fn change_team(room: &mut Room, user_id: UserId, team_id: u32) -> MultiplayerResult<()> {
    if room.settings.match_type != MatchType::TeamVersus {
        return Err(MultiplayerError::invalid_state(
            "this room has no teams",
        ));
    }
    if team_id >= TEAM_COUNT {
        return Err(MultiplayerError::invalid_state(format!(
            "team {team_id} does not exist"
        )));
    }
    let Some(user) = room.users.get_mut(&user_id) else {
        return Err(MultiplayerError::not_found(format!(
            "user {user_id} is not in room {}",
            room.id()
        )));
    };

    let role = MatchRole::Team { id: team_id };
    if user.match_role == role {
        return Ok(());
    }
    user.match_role = role;
    room.push_event(RoomEvent::MatchRoleChanged { user_id, role });
    Ok(())
}

/// Aggregate the finishing users into the results fan-out, grouped by team
/// for team-versus rooms and in finish order otherwise.
pub fn standings(room: &Room, finished: &[UserId]) -> Vec<StandingEntry> {
    let mut entries: Vec<StandingEntry> = finished
        .iter()
        .filter_map(|user_id| room.users.get(user_id))
        .map(|user| StandingEntry {
            user_id: user.user_id,
            team_id: match user.match_role {
                MatchRole::Team { id } => Some(id),
                MatchRole::None => None,
            },
        })
        .collect();
    entries.sort_by_key(|entry| entry.team_id);
    entries
}

fn smallest_team(room: &Room) -> u32 {
    (0..TEAM_COUNT)
        .min_by_key(|&team| {
            room.users
                .values()
                .filter(|user| user.match_role == MatchRole::Team { id: team })
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::test_room;

    fn team_room() -> Room {
        let mut room = test_room(1);
        room.settings.match_type = MatchType::TeamVersus;
        room
    }

    #[test]
    fn joins_balance_across_teams() {
        let mut room = team_room();
        for user_id in 0..4 {
            room.join_user(user_id, None).unwrap();
        }

        let team_sizes: Vec<usize> = (0..TEAM_COUNT)
            .map(|team| {
                room.users
                    .values()
                    .filter(|user| user.match_role == MatchRole::Team { id: team })
                    .count()
            })
            .collect();
        assert_eq!(team_sizes, vec![2, 2]);
    }

    #[test]
    fn head_to_head_assigns_no_role() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        assert_eq!(room.users[&10].match_role, MatchRole::None);
    }

    #[test]
    fn change_team_validates_bounds() {
        let mut room = team_room();
        room.join_user(10, None).unwrap();

        let err = change_team(&mut room, 10, 5).unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));

        change_team(&mut room, 10, 1).unwrap();
        assert_eq!(room.users[&10].match_role, MatchRole::Team { id: 1 });
    }

    #[test]
    fn change_team_rejected_in_head_to_head() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();

        let err = change_team(&mut room, 10, 0).unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));
    }

    #[test]
    fn switching_match_type_reassigns_roles() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();

        room.settings.match_type = MatchType::TeamVersus;
        reassign_roles(&mut room);
        assert!(matches!(room.users[&10].match_role, MatchRole::Team { .. }));

        room.settings.match_type = MatchType::HeadToHead;
        reassign_roles(&mut room);
        assert_eq!(room.users[&10].match_role, MatchRole::None);
    }
}
