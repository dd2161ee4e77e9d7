/// OpenAPI document aggregation.
pub mod documentation;
/// Health status reporting.
pub mod health_service;
/// Room event translation and fan-out primitives.
pub mod hub_events;
/// The multiplayer hub dispatch layer.
pub mod hub_service;
/// Beatmap metadata polling and broadcast.
pub mod metadata_service;
/// The replay upload pipeline.
pub mod score_upload;
/// Spectator session tracking.
pub mod spectator_service;
/// Client WebSocket connection lifecycle.
pub mod websocket_service;
