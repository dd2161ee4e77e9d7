//! Process-wide configuration for the multiplayer backend.

use std::{
    env,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tracing::warn;

/// Environment variable prefix shared by all recognized options.
const ENV_PREFIX: &str = "PULSE_ARENA_";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UPLOADER_CONCURRENCY: u32 = 1;
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_METADATA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime configuration shared across the application.
///
/// `save_replays` is mutable at runtime through an explicit setter; the
/// upload pipeline reads it at each item-pickup boundary. Everything else is
/// fixed once the process starts.
#[derive(Debug)]
pub struct ServerConfig {
    port: u16,
    save_replays: AtomicBool,
    replay_uploader_concurrency: u32,
    upload_timeout: Duration,
    metadata_poll_interval: Duration,
}

impl ServerConfig {
    /// Load the configuration from `PULSE_ARENA_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            port: parse_var("PORT").unwrap_or(DEFAULT_PORT),
            save_replays: AtomicBool::new(parse_var("SAVE_REPLAYS").unwrap_or(false)),
            replay_uploader_concurrency: parse_var("REPLAY_UPLOADER_CONCURRENCY")
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_UPLOADER_CONCURRENCY),
            upload_timeout: parse_var("UPLOAD_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_UPLOAD_TIMEOUT),
            metadata_poll_interval: parse_var("METADATA_POLL_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_METADATA_POLL_INTERVAL),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether completed replays should be written to blob storage.
    pub fn save_replays(&self) -> bool {
        self.save_replays.load(Ordering::Acquire)
    }

    /// Flip the replay switch; honored by the pipeline at the next pickup.
    pub fn set_save_replays(&self, enabled: bool) {
        self.save_replays.store(enabled, Ordering::Release);
    }

    /// Number of concurrent upload workers, fixed at pipeline construction.
    pub fn replay_uploader_concurrency(&self) -> u32 {
        self.replay_uploader_concurrency
    }

    /// Maximum time an enqueued score may wait for its token to resolve.
    pub fn upload_timeout(&self) -> Duration {
        self.upload_timeout
    }

    /// Delay between beatmap metadata poll ticks.
    pub fn metadata_poll_interval(&self) -> Duration {
        self.metadata_poll_interval
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            save_replays: AtomicBool::new(false),
            replay_uploader_concurrency: DEFAULT_UPLOADER_CONCURRENCY,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            metadata_poll_interval: DEFAULT_METADATA_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Configuration with explicit pipeline knobs for tests.
    pub(crate) fn for_tests(
        save_replays: bool,
        replay_uploader_concurrency: u32,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            save_replays: AtomicBool::new(save_replays),
            replay_uploader_concurrency,
            upload_timeout,
            ..Self::default()
        }
    }
}

/// Read and parse a single prefixed environment variable.
fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{name}");
    let raw = env::var(&key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, raw = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert!(!config.save_replays());
        assert_eq!(config.replay_uploader_concurrency(), 1);
        assert_eq!(config.upload_timeout(), Duration::from_secs(30));
        assert_eq!(config.metadata_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn save_replays_setter_round_trips() {
        let config = ServerConfig::default();
        config.set_save_replays(true);
        assert!(config.save_replays());
        config.set_save_replays(false);
        assert!(!config.save_replays());
    }
}
