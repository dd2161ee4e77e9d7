use crate::{dto::health::HealthResponse, state::SharedState};

/// Snapshot process liveness and the directory counters.
pub fn health_status(state: &SharedState) -> HealthResponse {
    let connected_clients = state.connections().len();
    let open_rooms = state.rooms().room_count();

    if state.is_shutting_down() {
        HealthResponse::shutting_down(connected_clients, open_rooms)
    } else {
        HealthResponse::ok(connected_clients, open_rooms)
    }
}
