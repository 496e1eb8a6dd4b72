//! Client configuration.
//!
//! A single JSON document holding the relay list and the tunables of the
//! connection, validation and publish paths. Every field has a default, so
//! a partial (or absent) file is valid.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::nostr::{ValidationPolicy, DEFAULT_MAX_FUTURE_DRIFT_SECS};
use crate::relay::{ConnectionSettings, RelayError, RelayUrl};
use crate::store::DEFAULT_MAX_EVENTS;

/// Relays used when the configuration names none.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

/// Config files larger than this are rejected.
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    #[error("Config I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not a valid configuration document.
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A relay address was rejected.
    #[error(transparent)]
    InvalidRelay(#[from] RelayError),

    /// No per-user configuration directory exists on this platform.
    #[error("Could not determine the user configuration directory")]
    NoConfigDir,

    /// The file exceeds the size limit.
    #[error("Config file {0} is too large")]
    TooLarge(PathBuf),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Relay connection tunables, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for establishing a websocket session.
    pub connect_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Reconnect delay cap.
    pub backoff_max_ms: u64,
    /// Jitter fraction, clamped below 1.
    pub backoff_jitter: f64,
    /// How long a session must last before the backoff counter resets.
    pub stable_after_ms: u64,
    /// Consecutive invalid frames tolerated before reconnecting.
    pub max_protocol_violations: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl ConnectionConfig {
    /// Converts to the settings consumed by [`crate::relay::RelayConnection`].
    #[must_use]
    pub const fn to_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            backoff_jitter: self.backoff_jitter,
            stable_after: Duration::from_millis(self.stable_after_ms),
            max_protocol_violations: self.max_protocol_violations,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout_ms: settings.connect_timeout.as_millis() as u64,
            backoff_base_ms: settings.backoff_base.as_millis() as u64,
            backoff_max_ms: settings.backoff_max.as_millis() as u64,
            backoff_jitter: settings.backoff_jitter,
            stable_after_ms: settings.stable_after.as_millis() as u64,
            max_protocol_violations: settings.max_protocol_violations,
        }
    }
}

/// Timestamp tolerances for incoming events, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// How far in the future `created_at` may be. `None` disables the check.
    pub max_future_drift_secs: Option<i64>,
    /// How far in the past `created_at` may be. `None` disables the check.
    pub max_past_drift_secs: Option<i64>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_future_drift_secs: Some(DEFAULT_MAX_FUTURE_DRIFT_SECS),
            max_past_drift_secs: None,
        }
    }
}

impl ValidationConfig {
    /// Builds a validation policy evaluated at `now`.
    #[must_use]
    pub const fn policy_at(&self, now: i64) -> ValidationPolicy {
        ValidationPolicy {
            now,
            max_future_drift: self.max_future_drift_secs,
            max_past_drift: self.max_past_drift_secs,
        }
    }
}

/// Top-level client configuration.
///
/// # Example
///
/// ```
/// use gnostr_core::config::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(r#"{"relays": ["wss://nos.lol/"]}"#).unwrap();
/// assert_eq!(config.relay_urls()[0].as_str(), "wss://nos.lol");
/// assert_eq!(config.max_events, 50_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay addresses, in the order they were added.
    pub relays: Vec<String>,
    /// Capacity of the in-memory event store.
    pub max_events: usize,
    /// Per-subscription live channel depth.
    pub subscription_buffer: usize,
    /// How long to wait for each relay's `OK` when publishing.
    pub publish_timeout_ms: u64,
    /// Relay connection tunables.
    pub connection: ConnectionConfig,
    /// Incoming event tolerances.
    pub validation: ValidationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(ToString::to_string).collect(),
            max_events: DEFAULT_MAX_EVENTS,
            subscription_buffer: 1024,
            publish_timeout_ms: 10_000,
            connection: ConnectionConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// `<user config dir>/gnostr/config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if the platform has no such directory.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("gnostr").join("config.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Reads the configuration at `path`, or the defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(ConfigError::TooLarge(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parsed relay addresses. Invalid and duplicate entries are skipped.
    #[must_use]
    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        let mut urls: Vec<RelayUrl> = Vec::with_capacity(self.relays.len());
        for entry in &self.relays {
            match RelayUrl::parse(entry) {
                Ok(url) if !urls.contains(&url) => urls.push(url),
                Ok(_) => {}
                Err(e) => warn!(relay = %entry, error = %e, "ignoring configured relay"),
            }
        }
        urls
    }

    /// Adds a relay. Returns `false` if it was already configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRelay`] if `url` is not a websocket URL.
    pub fn add_relay(&mut self, url: &str) -> Result<bool> {
        let url = RelayUrl::parse(url)?;
        if self.relay_urls().contains(&url) {
            return Ok(false);
        }
        self.relays.push(url.into());
        Ok(true)
    }

    /// Removes a relay. Returns `false` if it was not configured.
    pub fn remove_relay(&mut self, url: &RelayUrl) -> bool {
        let before = self.relays.len();
        self.relays
            .retain(|entry| RelayUrl::parse(entry).map_or(true, |parsed| &parsed != url));
        self.relays.len() != before
    }

    /// Deadline for each relay's `OK` when publishing.
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_connection_settings() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.to_settings(), ConnectionSettings::default());
        assert_eq!(config.relay_urls().len(), DEFAULT_RELAYS.len());
        assert_eq!(
            config.validation.policy_at(42).max_future_drift,
            Some(DEFAULT_MAX_FUTURE_DRIFT_SECS)
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn save_then_load_preserves_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("gnostr").join("config.json");

        let mut config = ClientConfig::default();
        config.relays.clear();
        assert!(config.add_relay("wss://relay.example.com/").unwrap());
        config.connection.backoff_base_ms = 250;
        config.validation.max_past_drift_secs = Some(3600);
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.relays, vec!["wss://relay.example.com".to_string()]);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"connection": {"connect_timeout_ms": 500}}"#).unwrap();
        assert_eq!(
            config.connection.to_settings().connect_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.connection.max_protocol_violations, 10);
        assert_eq!(config.relays.len(), 4);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn relay_list_edits() {
        let mut config = ClientConfig::default();
        assert!(!config.add_relay("wss://nos.lol/").unwrap());
        assert!(matches!(
            config.add_relay("https://nos.lol"),
            Err(ConfigError::InvalidRelay(_))
        ));

        let nos = RelayUrl::parse("wss://nos.lol").unwrap();
        assert!(config.remove_relay(&nos));
        assert!(!config.remove_relay(&nos));
        assert_eq!(config.relay_urls().len(), 3);
    }

    #[test]
    fn invalid_and_duplicate_entries_are_skipped() {
        let config = ClientConfig {
            relays: vec![
                "wss://a.example".into(),
                "not a url".into(),
                "wss://a.example/".into(),
            ],
            ..ClientConfig::default()
        };
        assert_eq!(config.relay_urls().len(), 1);
    }
}
