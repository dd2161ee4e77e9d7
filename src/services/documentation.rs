use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Pulse Arena Back.
#[openapi(
    paths(crate::routes::health::healthcheck, crate::routes::websocket::ws_handler),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::ws::ClientRequest,
            crate::dto::ws::MatchRequest,
            crate::dto::ws::Reply,
            crate::dto::ws::ServerEvent,
            crate::dto::ws::WireError,
            crate::dto::room::PlaylistItemInput,
            crate::dto::room::RoomSettingsPatch,
            crate::dto::room::RoomSnapshot,
            crate::dto::room::CountdownSnapshot,
            crate::dto::score::Score,
            crate::dto::score::ScoreInfo,
            crate::dto::score::ApiUser,
            crate::dto::score::FrameBundle,
            crate::dto::score::FrameHeader,
            crate::dto::score::ReplayFrame,
            crate::dto::score::SpectatedUserState,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "multiplayer", description = "WebSocket operations for multiplayer and spectating"),
    )
)]
pub struct ApiDoc;
