//! TOML Configuration File Support
//!
//! Centralized configuration loading for the status engine, backed by an
//! optional TOML file at `~/.config/showstatus/status.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`SHOWSTATUS_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [poll]
//! interval_ms = 15000
//!
//! [thresholds]
//! offline_failures = 3
//! degraded_failures = 2
//! stale_after_ms = 60000
//!
//! [speaker]
//! countdown_tick_ms = 1000
//! extension_window_secs = 30
//!
//! [gating]
//! song_cooldown_ms = 15000
//!
//! [session]
//! file = "/home/me/.local/share/showstatus/visitor.json"
//! recent_request_ttl_ms = 300000
//! notice_ttl_ms = 6000
//! history_capacity = 50
//!
//! [endpoints]
//! show_url = "https://show.example.com/api/show"
//! controller_url = "https://show.example.com/api/fpp"
//! speaker_url = "https://show.example.com/api/speaker"
//! timeout_ms = 8000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateThresholds;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[poll]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollToml {
    /// Interval between fetch-all cycles in milliseconds
    pub interval_ms: Option<u64>,
}

/// `[thresholds]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsToml {
    /// Consecutive failures on both feeds before going offline
    pub offline_failures: Option<u32>,
    /// Consecutive failures on either feed before degrading
    pub degraded_failures: Option<u32>,
    /// Envelope age after which a feed counts as stale
    pub stale_after_ms: Option<u64>,
}

/// `[speaker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerToml {
    /// Countdown tick period in milliseconds
    pub countdown_tick_ms: Option<u64>,
    /// Remaining seconds at or below which extension is offered
    pub extension_window_secs: Option<u32>,
}

/// `[gating]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingToml {
    /// Per-song local cooldown after a successful request
    pub song_cooldown_ms: Option<u64>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Where the visitor record is stored
    pub file: Option<String>,
    /// Age after which a restored recent request is discarded
    pub recent_request_ttl_ms: Option<u64>,
    /// How long a notice stays up
    pub notice_ttl_ms: Option<u64>,
    /// Transition history ring size
    pub history_capacity: Option<usize>,
}

/// `[endpoints]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsToml {
    /// Show-control feed URL
    pub show_url: Option<String>,
    /// Playback-controller feed URL
    pub controller_url: Option<String>,
    /// Speaker-hardware feed URL
    pub speaker_url: Option<String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusToml {
    /// Poll section
    pub poll: PollToml,
    /// Thresholds section
    pub thresholds: ThresholdsToml,
    /// Speaker section
    pub speaker: SpeakerToml,
    /// Gating section
    pub gating: GatingToml,
    /// Session section
    pub session: SessionToml,
    /// Endpoints section
    pub endpoints: EndpointsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Upstream endpoints
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Show-control feed URL
    pub show_url: Option<String>,
    /// Playback-controller feed URL
    pub controller_url: Option<String>,
    /// Speaker-hardware feed URL
    pub speaker_url: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            show_url: None,
            controller_url: None,
            speaker_url: None,
            timeout: Duration::from_secs(8),
        }
    }
}

/// Centralized configuration for the status engine
#[derive(Clone, Debug)]
pub struct StatusConfig {
    /// Interval between fetch-all cycles
    pub poll_interval: Duration,
    /// Connectivity derivation thresholds
    pub thresholds: StateThresholds,
    /// Speaker countdown tick period
    pub countdown_tick: Duration,
    /// Extension window upper bound in seconds
    pub extension_window_secs: u32,
    /// Local per-song cooldown
    pub song_cooldown: Duration,
    /// How long a notice stays up before auto-clearing
    pub notice_ttl: Duration,
    /// Transition history capacity
    pub history_capacity: usize,
    /// Age after which a restored recent request is discarded
    pub recent_request_ttl: Duration,
    /// Re-entrant `set_state` depth at which a warning is logged
    pub reentrancy_warn_depth: usize,
    /// Upstream endpoints
    pub endpoints: EndpointConfig,
    /// Visitor record location
    pub session_file: Option<PathBuf>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            thresholds: StateThresholds::default(),
            countdown_tick: Duration::from_secs(1),
            extension_window_secs: 30,
            song_cooldown: Duration::from_secs(15),
            notice_ttl: Duration::from_secs(6),
            history_capacity: 50,
            recent_request_ttl: Duration::from_secs(300),
            reentrancy_warn_depth: 8,
            endpoints: EndpointConfig::default(),
            session_file: default_session_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StatusConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.countdown_tick.is_zero() {
            return Err(ConfigError::ValidationError(
                "countdown tick must be greater than zero".into(),
            ));
        }
        if self.thresholds.degraded_failures > self.thresholds.offline_failures {
            return Err(ConfigError::ValidationError(format!(
                "degraded_failures ({}) must not exceed offline_failures ({})",
                self.thresholds.degraded_failures, self.thresholds.offline_failures
            )));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "history capacity must be at least 1".into(),
            ));
        }
        let ttl = self.notice_ttl.as_millis();
        if !(5_000..=8_000).contains(&ttl) {
            return Err(ConfigError::ValidationError(format!(
                "notice ttl must be between 5000 and 8000 ms, got {ttl}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/showstatus/status.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("showstatus").join("status.toml"))
}

/// Get the default visitor record path
#[must_use]
pub fn default_session_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("showstatus").join("visitor.json"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<StatusConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StatusConfig, ConfigError> {
    let mut config = StatusConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StatusToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
pub fn apply_toml_config(config: &mut StatusConfig, toml: &StatusToml) {
    if let Some(ms) = toml.poll.interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }

    if let Some(n) = toml.thresholds.offline_failures {
        config.thresholds.offline_failures = n;
    }
    if let Some(n) = toml.thresholds.degraded_failures {
        config.thresholds.degraded_failures = n;
    }
    if let Some(ms) = toml.thresholds.stale_after_ms {
        config.thresholds.stale_after_ms = ms;
    }

    if let Some(ms) = toml.speaker.countdown_tick_ms {
        config.countdown_tick = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.speaker.extension_window_secs {
        config.extension_window_secs = secs;
    }

    if let Some(ms) = toml.gating.song_cooldown_ms {
        config.song_cooldown = Duration::from_millis(ms);
    }

    if let Some(ref file) = toml.session.file {
        config.session_file = Some(PathBuf::from(file));
    }
    if let Some(ms) = toml.session.recent_request_ttl_ms {
        config.recent_request_ttl = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.session.notice_ttl_ms {
        config.notice_ttl = Duration::from_millis(ms);
    }
    if let Some(n) = toml.session.history_capacity {
        config.history_capacity = n;
    }

    if toml.endpoints.show_url.is_some() {
        config.endpoints.show_url = toml.endpoints.show_url.clone();
    }
    if toml.endpoints.controller_url.is_some() {
        config.endpoints.controller_url = toml.endpoints.controller_url.clone();
    }
    if toml.endpoints.speaker_url.is_some() {
        config.endpoints.speaker_url = toml.endpoints.speaker_url.clone();
    }
    if let Some(ms) = toml.endpoints.timeout_ms {
        config.endpoints.timeout = Duration::from_millis(ms);
    }
}

/// Apply `SHOWSTATUS_*` overrides using `lookup` to read variables
pub fn apply_env_overrides<F>(config: &mut StatusConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parse_ms = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
    let before = (
        config.poll_interval,
        config.thresholds.stale_after_ms,
        config.song_cooldown,
        config.endpoints.clone(),
        config.session_file.clone(),
    );

    if let Some(ms) = parse_ms("SHOWSTATUS_POLL_INTERVAL_MS") {
        config.poll_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_ms("SHOWSTATUS_STALE_AFTER_MS") {
        config.thresholds.stale_after_ms = ms;
    }
    if let Some(ms) = parse_ms("SHOWSTATUS_SONG_COOLDOWN_MS") {
        config.song_cooldown = Duration::from_millis(ms);
    }
    for (key, slot) in [
        ("SHOWSTATUS_SHOW_URL", &mut config.endpoints.show_url),
        ("SHOWSTATUS_CONTROLLER_URL", &mut config.endpoints.controller_url),
        ("SHOWSTATUS_SPEAKER_URL", &mut config.endpoints.speaker_url),
    ] {
        if let Some(url) = lookup(key) {
            *slot = Some(url);
        }
    }
    if let Some(path) = lookup("SHOWSTATUS_SESSION_FILE") {
        config.session_file = Some(PathBuf::from(path));
    }

    let after = (
        config.poll_interval,
        config.thresholds.stale_after_ms,
        config.song_cooldown,
        config.endpoints.clone(),
        config.session_file.clone(),
    );
    if after != before {
        config.source = ConfigSource::Env;
    }
}
