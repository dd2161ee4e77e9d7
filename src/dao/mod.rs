/// Database port consumed by the room engine and upload pipeline.
pub mod database;
/// In-memory port implementations backing the binary and the test suite.
pub mod memory;
/// Persisted record definitions.
pub mod models;
/// Blob storage port for finalized replays.
pub mod storage;
