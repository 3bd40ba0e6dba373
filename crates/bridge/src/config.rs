//! Environment configuration and fixed media constants.
//!
//! Sample rates, frame sizes and sampler parameters are compile-time
//! constants of the wire contract, not runtime-negotiated values.

use std::time::Duration;
use tracing::Level;

/// Default backend endpoint; overridable via `BRIDGE_WS_URL`.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/playground/bidi";

/// Samples per capture frame delivered by the audio graph.
pub const CAPTURE_FRAME_SIZE: usize = 4096;
/// Delay before an automatic reconnection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Cadence of screen/webcam frame sampling.
pub const FRAME_INTERVAL: Duration = Duration::from_secs(1);
/// Square bound frames are downscaled to fit, preserving aspect ratio.
pub const FRAME_BOUND: u32 = 768;
/// JPEG quality for sampled frames (0.7 on the encoder's 0..=100 scale).
pub const JPEG_QUALITY: u8 = 70;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub ws_base_url: String,
    pub user_id: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let ws_base_url =
            std::env::var("BRIDGE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());

        // Session identity is (user_id, session_id); the session half is
        // regenerated per connection by the transport.
        let user_id = std::env::var("BRIDGE_USER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            ws_base_url,
            user_id,
            log_level,
        })
    }
}
