//! Minimal configuration loading for tankwatch.
//!
//! Both the engine (`tankwatch`) and the bot (`tankbot`) read their settings
//! from here, so this crate keeps its dependencies small.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, key by key):
//! 1. `/etc/tankwatch/config.toml` (system)
//! 2. `~/.config/tankwatch/config.toml` (user)
//! 3. `./tankwatch.toml` or the `--config` path (local override)
//! 4. Environment variables (`TANKWATCH_*`, `TELEGRAM_TOKEN`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [feed]
//! server = "https://push.lightstreamer.com"
//! adapter_set = "ISSLIVE"
//! item = "NODE3000005"
//!
//! [detector]
//! significance_threshold = 0.5
//!
//! [session]
//! staleness_window_secs = 900
//!
//! [telegram]
//! token = "123456:ABC..."
//! ```
//!
//! The significance threshold and staleness window have no compiled default.
//! [`TankConfig::validate`] refuses to hand out a config without them.

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    BindConfig, DetectorConfig, FeedConfig, PathsConfig, SessionConfig, TelegramConfig,
    TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Missing required setting {key}")]
    Missing { key: &'static str },

    #[error("Invalid setting {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete tankwatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TankConfig {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub bind: BindConfig,
}

impl TankConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file, then apply env overrides.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let layer = loader::load_layer(&path)?;
            loader::merge_layers(&mut merged, layer);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::build_config(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Check everything the engine needs before it may start.
    ///
    /// The bot token is checked separately by [`TankConfig::telegram_token`]
    /// because `tankbot probe` runs without one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self
            .detector
            .significance_threshold
            .ok_or(ConfigError::Missing {
                key: "detector.significance_threshold",
            })?;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "detector.significance_threshold".to_string(),
                message: format!("must be a positive number, got {}", threshold),
            });
        }

        let staleness = self
            .session
            .staleness_window_secs
            .ok_or(ConfigError::Missing {
                key: "session.staleness_window_secs",
            })?;
        if staleness == 0 {
            return Err(ConfigError::Invalid {
                key: "session.staleness_window_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.feed.item.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "feed.item".to_string(),
                message: "item name is empty".to_string(),
            });
        }
        if self.feed.value_field.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "feed.value_field".to_string(),
                message: "field name is empty".to_string(),
            });
        }

        if self.session.watchdog_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "session.watchdog_interval_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.session.backoff_base_ms == 0
            || self.session.backoff_base_ms > self.session.backoff_max_ms
        {
            return Err(ConfigError::Invalid {
                key: "session.backoff_base_ms".to_string(),
                message: format!(
                    "must be positive and not above backoff_max_ms ({} > {})",
                    self.session.backoff_base_ms, self.session.backoff_max_ms
                ),
            });
        }

        Ok(())
    }

    /// The bot token, or a `Missing` error.
    pub fn telegram_token(&self) -> Result<&str, ConfigError> {
        self.telegram
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing {
                key: "telegram.token",
            })
    }

    /// Serialize config to TOML string, with the bot token redacted.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# tankwatch configuration\n\n");

        output.push_str("[feed]\n");
        output.push_str(&format!("server = \"{}\"\n", self.feed.server));
        output.push_str(&format!("adapter_set = \"{}\"\n", self.feed.adapter_set));
        output.push_str(&format!("item = \"{}\"\n", self.feed.item));
        output.push_str(&format!("value_field = \"{}\"\n", self.feed.value_field));
        output.push_str(&format!(
            "timestamp_field = \"{}\"\n",
            self.feed.timestamp_field
        ));
        output.push_str(&format!("status_field = \"{}\"\n", self.feed.status_field));
        output.push_str(&format!("keepalive_ms = {}\n", self.feed.keepalive_ms));
        output.push_str(&format!("read_timeout_ms = {}\n", self.feed.read_timeout_ms));

        output.push_str("\n[detector]\n");
        match self.detector.significance_threshold {
            Some(v) => output.push_str(&format!("significance_threshold = {}\n", v)),
            None => output.push_str("# significance_threshold = <required>\n"),
        }

        output.push_str("\n[session]\n");
        match self.session.staleness_window_secs {
            Some(v) => output.push_str(&format!("staleness_window_secs = {}\n", v)),
            None => output.push_str("# staleness_window_secs = <required>\n"),
        }
        output.push_str(&format!(
            "watchdog_interval_secs = {}\n",
            self.session.watchdog_interval_secs
        ));
        output.push_str(&format!(
            "backoff_base_ms = {}\n",
            self.session.backoff_base_ms
        ));
        output.push_str(&format!("backoff_max_ms = {}\n", self.session.backoff_max_ms));
        output.push_str(&format!(
            "stable_after_secs = {}\n",
            self.session.stable_after_secs
        ));

        output.push_str("\n[telegram]\n");
        match self.telegram.token {
            Some(_) => output.push_str("token = \"<redacted>\"\n"),
            None => output.push_str("# token = <required for run>\n"),
        }
        output.push_str(&format!("api_base = \"{}\"\n", self.telegram.api_base));
        output.push_str(&format!(
            "poll_timeout_secs = {}\n",
            self.telegram.poll_timeout_secs
        ));

        output.push_str("\n[paths]\n");
        output.push_str(&format!(
            "state_dir = \"{}\"\n",
            self.paths.state_dir.display()
        ));
        output.push_str(&format!(
            "subscribers_file = \"{}\"\n",
            self.paths.subscribers_file().display()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output.push_str("\n[bind]\n");
        if let Some(port) = self.bind.health_port {
            output.push_str(&format!("health_port = {}\n", port));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated() -> TankConfig {
        let mut config = TankConfig::default();
        config.detector.significance_threshold = Some(0.5);
        config.session.staleness_window_secs = Some(600);
        config
    }

    #[test]
    fn test_default_config() {
        let config = TankConfig::default();
        assert_eq!(config.feed.adapter_set, "ISSLIVE");
        assert_eq!(config.feed.item, "NODE3000005");
        assert_eq!(config.bind.health_port, None);
    }

    #[test]
    fn test_defaults_refuse_to_validate() {
        let err = TankConfig::default().validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                key: "detector.significance_threshold"
            }
        ));
    }

    #[test]
    fn test_missing_staleness_window() {
        let mut config = calibrated();
        config.session.staleness_window_secs = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing {
                key: "session.staleness_window_secs"
            })
        ));
    }

    #[test]
    fn test_calibrated_config_validates() {
        calibrated().validate().unwrap();
    }

    #[test]
    fn test_rejects_nonpositive_threshold() {
        let mut config = calibrated();
        config.detector.significance_threshold = Some(0.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.detector.significance_threshold = Some(f64::NAN);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_empty_item() {
        let mut config = calibrated();
        config.feed.item = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = calibrated();
        config.session.backoff_base_ms = 10_000;
        config.session.backoff_max_ms = 1_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_telegram_token_required() {
        let mut config = calibrated();
        assert!(config.telegram_token().is_err());
        config.telegram.token = Some("".to_string());
        assert!(config.telegram_token().is_err());
        config.telegram.token = Some("123:abc".to_string());
        assert_eq!(config.telegram_token().unwrap(), "123:abc");
    }

    #[test]
    fn test_to_toml_redacts_token() {
        let mut config = calibrated();
        config.telegram.token = Some("123:secret".to_string());
        let toml = config.to_toml();
        assert!(toml.contains("[feed]"));
        assert!(toml.contains("significance_threshold = 0.5"));
        assert!(toml.contains("<redacted>"));
        assert!(!toml.contains("secret"));
    }

    #[test]
    fn test_to_toml_round_trips_through_loader() {
        let config = calibrated();
        let layer = loader::parse_layer(&config.to_toml(), Path::new("rendered")).unwrap();
        let reparsed = loader::build_config(layer, Path::new("rendered")).unwrap();
        assert_eq!(reparsed.detector, config.detector);
        assert_eq!(reparsed.session, config.session);
        assert_eq!(reparsed.feed, config.feed);
    }
}
