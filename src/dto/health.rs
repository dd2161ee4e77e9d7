use serde::Serialize;
use utoipa::ToSchema;

/// Health payload returned by the `/api/health` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status (`ok` or `shutting_down`).
    pub status: String,
    /// Number of currently connected clients.
    pub connected_clients: usize,
    /// Number of active multiplayer rooms.
    pub open_rooms: usize,
}

impl HealthResponse {
    /// Create a health response for a live process.
    pub fn ok(connected_clients: usize, open_rooms: usize) -> Self {
        Self {
            status: "ok".to_string(),
            connected_clients,
            open_rooms,
        }
    }

    /// Create a health response for a process draining connections.
    pub fn shutting_down(connected_clients: usize, open_rooms: usize) -> Self {
        Self {
            status: "shutting_down".to_string(),
            connected_clients,
            open_rooms,
        }
    }
}
