use crate::{artifact::ArtifactTracker, error::sanitize_error_message};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Once,
};
use thiserror::Error;

/// State file location used when persistence is on and no explicit path is configured.
pub const DEFAULT_STATE_FILE: &str = ".nova/cache/bazel-deps.json";

const STATE_FILE_ENV: &str = "NOVA_DEPS_STATE_FILE";
const PERSIST_ENV: &str = "NOVA_DEPS_PERSIST";

static TRACING_INIT: Once = Once::new();

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for {name}: expected a boolean")]
    InvalidEnv { name: &'static str },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a snippet of the input; keep only the message.
        ConfigError::Toml(sanitize_error_message(err.message()))
    }
}

/// Settings for dependency tracking, usually read from a `[deps]`-style TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepsConfig {
    /// Root that relative paths (state file, artifact inputs, requested paths) resolve against.
    pub workspace_root: Option<PathBuf>,
    /// Where the artifact tracker persists its state.
    pub state_file: Option<PathBuf>,
    /// When false, built targets are tracked in memory only.
    pub persist: bool,
    pub logging: LoggingConfig,
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            state_file: None,
            persist: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl DepsConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `NOVA_DEPS_STATE_FILE` and `NOVA_DEPS_PERSIST` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(STATE_FILE_ENV) {
            let value = value.trim();
            self.state_file = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = lookup(PERSIST_ENV) {
            self.persist = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidEnv { name: PERSIST_ENV }),
            };
        }
        Ok(())
    }

    /// The state file the tracker should use, if any.
    ///
    /// Relative paths resolve against `workspace_root`. Without an explicit `state_file`,
    /// [`DEFAULT_STATE_FILE`] under the workspace root is used.
    pub fn resolved_state_file(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        match (&self.state_file, &self.workspace_root) {
            (Some(path), Some(root)) if path.is_relative() => Some(root.join(path)),
            (Some(path), _) => Some(path.clone()),
            (None, Some(root)) => Some(root.join(DEFAULT_STATE_FILE)),
            (None, None) => None,
        }
    }

    /// An [`ArtifactTracker`] set up from this config, loading any persisted state.
    pub fn artifact_tracker(&self) -> ArtifactTracker {
        let mut tracker = ArtifactTracker::new();
        if let Some(root) = &self.workspace_root {
            tracker = tracker.with_workspace_root(root);
        }
        if let Some(path) = self.resolved_state_file() {
            tracker = tracker.with_state_file(path);
        }
        tracker
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level, with `RUST_LOG` merged on top when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let combined = format!(
                    "{},{env_directives}",
                    Self::normalize_level_directives(&self.level)
                );
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

/// Install a global fmt subscriber for `config`.
///
/// Only the first call in a process has an effect. Returns whether this call installed the
/// subscriber; `false` also covers a subscriber installed elsewhere.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let result = if config.json {
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        } else {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        };
        installed = result.is_ok();
        if installed {
            tracing::debug!(
                target = "nova.build.deps",
                json = config.json,
                "tracing initialized"
            );
        }
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DepsConfig::from_toml_str("").unwrap();
        assert_eq!(config, DepsConfig::default());
        assert!(config.persist);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_all_fields() {
        let config = DepsConfig::from_toml_str(
            r#"
workspace_root = "/work/repo"
state_file = "out/deps.json"
persist = false

[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();

        assert_eq!(config.workspace_root, Some(PathBuf::from("/work/repo")));
        assert_eq!(config.state_file, Some(PathBuf::from("out/deps.json")));
        assert!(!config.persist);
        assert_eq!(
            config.logging,
            LoggingConfig {
                level: "debug".to_owned(),
                json: true,
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected_without_echoing_them() {
        let err = DepsConfig::from_toml_str("api_token = \"hunter2\"\n").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ConfigError::Toml(_)), "{message}");
        assert!(!message.contains("api_token"), "{message}");
        assert!(!message.contains("hunter2"), "{message}");
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = DepsConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("missing.toml"), "{err}");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env = HashMap::from([
            (STATE_FILE_ENV, "/tmp/override.json"),
            (PERSIST_ENV, " Off "),
        ]);
        let mut config = DepsConfig {
            state_file: Some(PathBuf::from("configured.json")),
            ..DepsConfig::default()
        };
        config
            .apply_env_overrides_from(|name| env.get(name).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.state_file, Some(PathBuf::from("/tmp/override.json")));
        assert!(!config.persist);
    }

    #[test]
    fn invalid_persist_override_is_an_error() {
        let mut config = DepsConfig::default();
        let err = config
            .apply_env_overrides_from(|name| (name == PERSIST_ENV).then(|| "maybe".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: PERSIST_ENV }));
        assert!(config.persist);
    }

    #[test]
    fn state_file_resolution() {
        let root = PathBuf::from("/work/repo");
        let mut config = DepsConfig {
            workspace_root: Some(root.clone()),
            ..DepsConfig::default()
        };
        assert_eq!(
            config.resolved_state_file(),
            Some(root.join(DEFAULT_STATE_FILE))
        );

        config.state_file = Some(PathBuf::from("deps.json"));
        assert_eq!(config.resolved_state_file(), Some(root.join("deps.json")));

        config.persist = false;
        assert_eq!(config.resolved_state_file(), None);

        assert_eq!(DepsConfig::default().resolved_state_file(), None);
    }

    #[test]
    fn level_directives_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level_directives("nova.build.deps=trace"),
            "nova.build.deps=trace"
        );
    }
}
