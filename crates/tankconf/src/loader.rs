//! Config file discovery, layering, and environment variable overlay.

use crate::{ConfigError, TankConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tankwatch/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tankwatch/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tankwatch.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table layer.
pub fn load_layer(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_layer(&contents, path)
}

/// Parse a TOML string into a raw table layer.
pub fn parse_layer(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, key by key.
///
/// Nested tables merge recursively; any other value in the overlay replaces
/// the base value outright (arrays included).
pub fn merge_layers(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge_layers(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Turn the merged layer into a typed config, filling compiled defaults.
pub fn build_config(layer: toml::Table, origin: &Path) -> Result<TankConfig, ConfigError> {
    let mut config: TankConfig =
        toml::Value::Table(layer)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    let state_dir = config.paths.state_dir.to_string_lossy().into_owned();
    config.paths.state_dir = expand_path(&state_dir);
    if let Some(file) = config.paths.subscribers_file.take() {
        config.paths.subscribers_file = Some(expand_path(&file.to_string_lossy()));
    }

    Ok(config)
}

/// Apply environment variable overrides from the process environment.
pub fn apply_env_overrides(
    config: &mut TankConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    apply_env_overrides_from(config, sources, env::vars())
}

/// Apply overrides from an explicit set of variables.
///
/// Unknown variables are ignored. Numeric variables that fail to parse are
/// configuration errors, since a silently ignored threshold is worse than
/// refusing to start.
pub fn apply_env_overrides_from<I>(
    config: &mut TankConfig,
    sources: &mut ConfigSources,
    vars: I,
) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars: Vec<(String, String)> = vars.into_iter().collect();
    // TANKWATCH_* beats the legacy/generic names regardless of env ordering
    vars.sort_by_key(|(key, _)| key.starts_with("TANKWATCH_"));

    for (key, value) in vars {
        let applied = match key.as_str() {
            // Feed
            "TANKWATCH_FEED_SERVER" => {
                config.feed.server = value;
                true
            }
            "TANKWATCH_ADAPTER_SET" => {
                config.feed.adapter_set = value;
                true
            }
            "TANKWATCH_FEED_ITEM" => {
                config.feed.item = value;
                true
            }

            // Calibration
            "TANKWATCH_THRESHOLD" => {
                config.detector.significance_threshold = Some(parse_env(&key, &value)?);
                true
            }
            "TANKWATCH_STALENESS_SECS" => {
                config.session.staleness_window_secs = Some(parse_env(&key, &value)?);
                true
            }

            // Telegram
            "TANKWATCH_TELEGRAM_TOKEN" | "TELEGRAM_TOKEN" => {
                config.telegram.token = Some(value);
                true
            }

            // Paths
            "TANKWATCH_STATE_DIR" => {
                config.paths.state_dir = expand_path(&value);
                true
            }
            "TANKWATCH_SUBSCRIBERS_FILE" => {
                config.paths.subscribers_file = Some(expand_path(&value));
                true
            }

            // Logging
            "TANKWATCH_LOG_LEVEL" | "RUST_LOG" => {
                config.telemetry.log_level = value;
                true
            }

            "TANKWATCH_HEALTH_PORT" => {
                config.bind.health_port = Some(parse_env(&key, &value)?);
                true
            }

            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }

    Ok(())
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("{:?}: {}", value, e),
    })
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(s: &str) -> toml::Table {
        parse_layer(s, Path::new("test.toml")).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = build_config(
            layer(
                r#"
[detector]
significance_threshold = 0.5
"#,
            ),
            Path::new("test.toml"),
        )
        .unwrap();

        assert_eq!(config.detector.significance_threshold, Some(0.5));
        assert_eq!(config.feed.item, "NODE3000005");
        assert_eq!(config.session.staleness_window_secs, None);
    }

    #[test]
    fn test_later_layer_wins_per_key() {
        let mut base = layer(
            r#"
[feed]
item = "NODE3000005"
adapter_set = "ISSLIVE"

[session]
staleness_window_secs = 600
backoff_max_ms = 30000
"#,
        );
        let overlay = layer(
            r#"
[feed]
item = "NODE3000004"

[session]
staleness_window_secs = 120
"#,
        );

        merge_layers(&mut base, overlay);
        let config = build_config(base, Path::new("merged")).unwrap();

        assert_eq!(config.feed.item, "NODE3000004");
        assert_eq!(config.feed.adapter_set, "ISSLIVE");
        assert_eq!(config.session.staleness_window_secs, Some(120));
        assert_eq!(config.session.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let result = build_config(
            layer(
                r#"
[detector]
significance_threshold = "half a percent"
"#,
            ),
            Path::new("bad.toml"),
        );
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TankConfig::default();
        let mut sources = ConfigSources::default();

        apply_env_overrides_from(
            &mut config,
            &mut sources,
            vars(&[
                ("TANKWATCH_THRESHOLD", "2.5"),
                ("TANKWATCH_STALENESS_SECS", "300"),
                ("TELEGRAM_TOKEN", "123:abc"),
                ("HOME", "/root"),
            ]),
        )
        .unwrap();

        assert_eq!(config.detector.significance_threshold, Some(2.5));
        assert_eq!(config.session.staleness_window_secs, Some(300));
        assert_eq!(config.telegram.token.as_deref(), Some("123:abc"));
        assert_eq!(sources.env_overrides.len(), 3);
    }

    #[test]
    fn test_prefixed_token_beats_legacy_name() {
        let mut config = TankConfig::default();
        let mut sources = ConfigSources::default();

        apply_env_overrides_from(
            &mut config,
            &mut sources,
            vars(&[
                ("TANKWATCH_TELEGRAM_TOKEN", "new"),
                ("TELEGRAM_TOKEN", "old"),
            ]),
        )
        .unwrap();

        assert_eq!(config.telegram.token.as_deref(), Some("new"));
    }

    #[test]
    fn test_unparsable_env_number_is_fatal() {
        let mut config = TankConfig::default();
        let mut sources = ConfigSources::default();

        let err = apply_env_overrides_from(
            &mut config,
            &mut sources,
            vars(&[("TANKWATCH_THRESHOLD", "lots")]),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TANKWATCH_THRESHOLD"));
    }
}
