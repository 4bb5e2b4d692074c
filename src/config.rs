//! Runtime configuration.
//!
//! Provider credentials and endpoints come from the environment. Operational
//! limits are compile-time defaults; only the session idle timeout is
//! overridable from the CLI.

use std::time::Duration;

use anyhow::{Context, Result};

/// Largest WebSocket message the server accepts. Uploads are chunked well
/// below this; anything bigger is a misbehaving client.
pub const MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

/// Default idle timeout for upload sessions and tracked jobs.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(15 * 60);

/// How long completed/expired upload tombstones linger so late retries get
/// a precise error.
pub const TOMBSTONE_GRACE: Duration = Duration::from_secs(5 * 60);

/// Interval of the background eviction sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Config {
    pub transcription_api_key: String,
    pub translation_api_key: String,
    pub transcription_base_url: Option<String>,
    pub translation_base_url: Option<String>,
    pub translation_model: Option<String>,
    /// Source language submitted with every transcription job.
    pub language_code: String,
    pub max_message_bytes: usize,
    pub session_idle: Duration,
    pub tombstone_grace: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    /// Build a config from the process environment.
    ///
    /// `ASSEMBLYAI_API_KEY` and `OPENAI_API_KEY` are required; base URLs,
    /// model, and language code are optional overrides.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            transcription_api_key: std::env::var("ASSEMBLYAI_API_KEY")
                .context("ASSEMBLYAI_API_KEY is not set")?,
            translation_api_key: std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is not set")?,
            transcription_base_url: std::env::var("ASSEMBLYAI_BASE_URL").ok(),
            translation_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            translation_model: std::env::var("TRANSLATION_MODEL").ok(),
            language_code: std::env::var("LANGUAGE_CODE").unwrap_or_else(|_| "hi".to_string()),
            max_message_bytes: MAX_MESSAGE_BYTES,
            session_idle: DEFAULT_SESSION_IDLE,
            tombstone_grace: TOMBSTONE_GRACE,
            sweep_interval: SWEEP_INTERVAL,
        })
    }
}
