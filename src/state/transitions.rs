//! User-state transition rules and the synchronized gameplay cycle.

use crate::{
    error::{MultiplayerError, MultiplayerResult},
    state::{
        countdown::CountdownKind,
        room::{Room, RoomEvent, RoomState, UserId, UserState},
    },
};

/// Who asked for the match to start.
#[derive(Debug, Clone, Copy)]
pub enum StartInitiator {
    /// A client RPC; host authority and readiness are enforced.
    User(UserId),
    /// A match-start countdown firing; the start is best-effort.
    Countdown,
}

impl Room {
    /// Apply a client-requested state change.
    ///
    /// Requesting the current state is a no-op and emits nothing. States
    /// reserved for the server fail with `InvalidStateChange`; requestable
    /// states still validate against the current position in the cycle.
    pub fn change_user_state(
        &mut self,
        user_id: UserId,
        requested: UserState,
    ) -> MultiplayerResult<()> {
        let Some(user) = self.users.get(&user_id) else {
            return Err(MultiplayerError::not_found(format!(
                "user {user_id} is not in room {}",
                self.id()
            )));
        };

        if !requested.is_client_requestable() {
            return Err(MultiplayerError::InvalidStateChange(format!(
                "{requested:?} is assigned by the server"
            )));
        }

        let current = user.state;
        if current == requested {
            return Ok(());
        }

        let allowed = match requested {
            UserState::Idle => true,
            UserState::Ready => current == UserState::Idle && self.state == RoomState::Open,
            UserState::Loaded => current == UserState::WaitingForLoad,
            UserState::ReadyForGameplay => current == UserState::Loaded,
            UserState::FinishedPlay => current == UserState::Playing,
            UserState::Spectating => current == UserState::Idle,
            _ => false,
        };
        if !allowed {
            return Err(MultiplayerError::invalid_state(format!(
                "cannot move from {current:?} to {requested:?}"
            )));
        }

        self.apply_user_state(user_id, requested);

        match requested {
            UserState::Loaded | UserState::ReadyForGameplay => self.try_begin_gameplay(),
            UserState::FinishedPlay | UserState::Idle => self.check_round_completion(),
            _ => {}
        }
        self.recompute_state();

        Ok(())
    }

    /// Begin the load phase: every ready user moves to `WaitingForLoad` and
    /// receives the load request; everyone else stays idle.
    pub fn start_match(&mut self, initiator: StartInitiator) -> MultiplayerResult<()> {
        if self.state != RoomState::Open {
            return Err(MultiplayerError::invalid_state(
                "the match has already been started",
            ));
        }

        if let StartInitiator::User(user_id) = initiator {
            self.require_host(user_id)?;
            let host_ready = self
                .host_user_id
                .and_then(|host| self.users.get(&host))
                .is_some_and(|host| host.state == UserState::Ready);
            if !host_ready {
                return Err(MultiplayerError::invalid_state(
                    "the host is not ready",
                ));
            }
        }

        let ready: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.state == UserState::Ready)
            .map(|user| user.user_id)
            .collect();
        if ready.is_empty() {
            return Err(MultiplayerError::invalid_state("no users are ready"));
        }

        for user_id in ready {
            self.apply_user_state(user_id, UserState::WaitingForLoad);
        }
        self.recompute_state();
        self.push_event(RoomEvent::LoadRequested);

        Ok(())
    }

    /// Start gameplay once every user in the load phase has finished
    /// loading. No-op while someone is still waiting.
    pub(crate) fn try_begin_gameplay(&mut self) {
        let loading: Vec<(UserId, UserState)> = self
            .users
            .values()
            .filter(|user| user.state.is_gameplay())
            .map(|user| (user.user_id, user.state))
            .collect();

        if loading.is_empty()
            || loading
                .iter()
                .any(|(_, state)| !state.is_done_loading() && *state != UserState::Playing)
        {
            return;
        }
        if loading.iter().all(|(_, state)| *state == UserState::Playing) {
            return;
        }

        for (user_id, state) in loading {
            if state.is_done_loading() {
                self.apply_user_state(user_id, UserState::Playing);
            }
        }
        self.stop_countdowns_of_kind(CountdownKind::ForceGameplayStart);
        self.push_event(RoomEvent::GameplayStarted);
        self.recompute_state();
    }

    /// Force the gameplay start after the load countdown expires: users who
    /// never finished loading fall back to idle, everyone loaded plays.
    pub(crate) fn force_gameplay_start(&mut self) {
        let stragglers: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.state == UserState::WaitingForLoad)
            .map(|user| user.user_id)
            .collect();
        for user_id in stragglers {
            self.apply_user_state(user_id, UserState::Idle);
        }
        self.try_begin_gameplay();
        self.check_round_completion();
        self.recompute_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::test_room;

    #[test]
    fn server_reserved_states_are_rejected() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();

        for state in [
            UserState::WaitingForLoad,
            UserState::Playing,
            UserState::Results,
        ] {
            let err = room.change_user_state(10, state).unwrap_err();
            assert!(matches!(err, MultiplayerError::InvalidStateChange(_)));
        }
    }

    #[test]
    fn repeated_change_state_is_a_silent_noop() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.take_events();

        room.change_user_state(10, UserState::Idle).unwrap();
        assert!(room.take_events().is_empty());
    }

    #[test]
    fn only_ready_users_enter_the_load_phase() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();

        room.change_user_state(10, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();

        assert_eq!(room.users[&10].state, UserState::WaitingForLoad);
        assert_eq!(room.users[&20].state, UserState::Idle);
        assert_eq!(room.state, RoomState::WaitingForLoad);
    }

    #[test]
    fn start_requires_ready_host() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();
        room.change_user_state(20, UserState::Ready).unwrap();

        let err = room.start_match(StartInitiator::User(10)).unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));
    }

    #[test]
    fn start_twice_is_invalid() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.change_user_state(10, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();

        let err = room.start_match(StartInitiator::User(10)).unwrap_err();
        assert!(matches!(err, MultiplayerError::InvalidState(_)));
    }

    #[test]
    fn gameplay_begins_when_all_loaded() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();
        room.change_user_state(10, UserState::Ready).unwrap();
        room.change_user_state(20, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();

        room.change_user_state(10, UserState::Loaded).unwrap();
        assert_eq!(room.users[&10].state, UserState::Loaded);
        assert_eq!(room.state, RoomState::Playing);

        room.change_user_state(20, UserState::Loaded).unwrap();
        assert_eq!(room.users[&10].state, UserState::Playing);
        assert_eq!(room.users[&20].state, UserState::Playing);
    }

    #[test]
    fn all_users_backing_out_reopens_the_room() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();
        room.change_user_state(10, UserState::Ready).unwrap();
        room.change_user_state(20, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();
        assert_eq!(room.state, RoomState::WaitingForLoad);

        room.change_user_state(10, UserState::Idle).unwrap();
        assert_eq!(room.state, RoomState::WaitingForLoad);
        room.change_user_state(20, UserState::Idle).unwrap();
        assert_eq!(room.state, RoomState::Open);
    }

    #[test]
    fn round_completes_when_every_player_finishes() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();
        room.change_user_state(10, UserState::Ready).unwrap();
        room.change_user_state(20, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();
        room.change_user_state(10, UserState::Loaded).unwrap();
        room.change_user_state(20, UserState::Loaded).unwrap();

        room.change_user_state(10, UserState::FinishedPlay).unwrap();
        assert_eq!(room.state, RoomState::Playing);

        room.change_user_state(20, UserState::FinishedPlay).unwrap();
        assert_eq!(room.users[&10].state, UserState::Results);
        assert_eq!(room.users[&20].state, UserState::Results);
        assert_eq!(room.state, RoomState::Open);
        assert!(room.take_round_completed());
    }

    #[test]
    fn disconnect_of_last_player_completes_the_round() {
        let mut room = test_room(1);
        room.join_user(10, None).unwrap();
        room.join_user(20, None).unwrap();
        room.change_user_state(10, UserState::Ready).unwrap();
        room.change_user_state(20, UserState::Ready).unwrap();
        room.start_match(StartInitiator::User(10)).unwrap();
        room.change_user_state(10, UserState::Loaded).unwrap();
        room.change_user_state(20, UserState::Loaded).unwrap();
        room.change_user_state(10, UserState::FinishedPlay).unwrap();

        room.remove_user(20).unwrap();
        assert_eq!(room.users[&10].state, UserState::Results);
        assert!(room.take_round_completed());
    }
}
