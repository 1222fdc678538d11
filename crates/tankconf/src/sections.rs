//! Configuration sections.
//!
//! Everything here has a compiled default except the two detector/session
//! calibration values, which must come from a file or the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Streaming feed endpoint and the single item we follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Lightstreamer server base URL.
    /// Default: https://push.lightstreamer.com
    #[serde(default = "FeedConfig::default_server")]
    pub server: String,

    /// Adapter set exposed by the server.
    /// Default: ISSLIVE
    #[serde(default = "FeedConfig::default_adapter_set")]
    pub adapter_set: String,

    /// Item name of the telemetry value (urine tank level).
    /// Default: NODE3000005
    #[serde(default = "FeedConfig::default_item")]
    pub item: String,

    #[serde(default = "FeedConfig::default_value_field")]
    pub value_field: String,

    #[serde(default = "FeedConfig::default_timestamp_field")]
    pub timestamp_field: String,

    #[serde(default = "FeedConfig::default_status_field")]
    pub status_field: String,

    /// Client identifier sent on session creation.
    #[serde(default = "FeedConfig::default_client_id")]
    pub client_id: String,

    /// Keepalive interval requested from the server, in milliseconds.
    /// Default: 5000
    #[serde(default = "FeedConfig::default_keepalive_ms")]
    pub keepalive_ms: u64,

    /// Silence on the stream longer than this is treated as a dead connection.
    /// Default: 30000
    #[serde(default = "FeedConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl FeedConfig {
    fn default_server() -> String {
        "https://push.lightstreamer.com".to_string()
    }

    fn default_adapter_set() -> String {
        "ISSLIVE".to_string()
    }

    fn default_item() -> String {
        "NODE3000005".to_string()
    }

    fn default_value_field() -> String {
        "Value".to_string()
    }

    fn default_timestamp_field() -> String {
        "TimeStamp".to_string()
    }

    fn default_status_field() -> String {
        "Status.Class".to_string()
    }

    fn default_client_id() -> String {
        "mgQkwtwdysogQz2BJ4Ji kOj2Bg".to_string()
    }

    fn default_keepalive_ms() -> u64 {
        5_000
    }

    fn default_read_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            server: Self::default_server(),
            adapter_set: Self::default_adapter_set(),
            item: Self::default_item(),
            value_field: Self::default_value_field(),
            timestamp_field: Self::default_timestamp_field(),
            status_field: Self::default_status_field(),
            client_id: Self::default_client_id(),
            keepalive_ms: Self::default_keepalive_ms(),
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

/// Change detection calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum absolute change (percentage points) that triggers a notification.
    /// Required, no default.
    #[serde(default)]
    pub significance_threshold: Option<f64>,
}

/// Session lifecycle timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without an update before a live connection is `Degraded`.
    /// Required, no default.
    #[serde(default)]
    pub staleness_window_secs: Option<u64>,

    /// How often the staleness watchdog runs.
    /// Default: 15
    #[serde(default = "SessionConfig::default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// First reconnect delay ceiling.
    /// Default: 1000
    #[serde(default = "SessionConfig::default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on the reconnect delay ceiling.
    /// Default: 60000
    #[serde(default = "SessionConfig::default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// A connection that lives this long resets the backoff attempt counter.
    /// Default: 30
    #[serde(default = "SessionConfig::default_stable_after_secs")]
    pub stable_after_secs: u64,
}

impl SessionConfig {
    fn default_watchdog_interval_secs() -> u64 {
        15
    }

    fn default_backoff_base_ms() -> u64 {
        1_000
    }

    fn default_backoff_max_ms() -> u64 {
        60_000
    }

    fn default_stable_after_secs() -> u64 {
        30
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: None,
            watchdog_interval_secs: Self::default_watchdog_interval_secs(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_max_ms: Self::default_backoff_max_ms(),
            stable_after_secs: Self::default_stable_after_secs(),
        }
    }
}

/// Telegram Bot API access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather. Required by `tankbot run`.
    #[serde(default)]
    pub token: Option<String>,

    /// Default: https://api.telegram.org
    #[serde(default = "TelegramConfig::default_api_base")]
    pub api_base: String,

    /// Long-poll timeout for getUpdates.
    /// Default: 30
    #[serde(default = "TelegramConfig::default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    fn default_api_base() -> String {
        "https://api.telegram.org".to_string()
    }

    fn default_poll_timeout_secs() -> u64 {
        30
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: Self::default_api_base(),
            poll_timeout_secs: Self::default_poll_timeout_secs(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for runtime state.
    /// Default: ~/.local/share/tankwatch
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Subscriber list. Defaults to `<state_dir>/subscribers.txt` when unset.
    #[serde(default)]
    pub subscribers_file: Option<PathBuf>,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tankwatch"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tankwatch"))
    }

    /// Resolved location of the subscriber list.
    pub fn subscribers_file(&self) -> PathBuf {
        self.subscribers_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("subscribers.txt"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            subscribers_file: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// EnvFilter directive (trace, debug, info, warn, error or a full filter).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Network bind addresses for this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// HTTP port for the health endpoint. Disabled when unset.
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_file_defaults_under_state_dir() {
        let paths = PathsConfig {
            state_dir: PathBuf::from("/var/lib/tankwatch"),
            subscribers_file: None,
        };
        assert_eq!(
            paths.subscribers_file(),
            PathBuf::from("/var/lib/tankwatch/subscribers.txt")
        );
    }

    #[test]
    fn explicit_subscribers_file_wins() {
        let paths = PathsConfig {
            state_dir: PathBuf::from("/var/lib/tankwatch"),
            subscribers_file: Some(PathBuf::from("/data/subs.txt")),
        };
        assert_eq!(paths.subscribers_file(), PathBuf::from("/data/subs.txt"));
    }

    #[test]
    fn calibration_values_have_no_default() {
        assert_eq!(DetectorConfig::default().significance_threshold, None);
        assert_eq!(SessionConfig::default().staleness_window_secs, None);
    }
}
