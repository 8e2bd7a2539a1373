//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Project config: `<root>/stagehand.toml`
//! 3. Environment variables: `STAGEHAND_*`
//!
//! # Example Config
//!
//! ```toml
//! [journal]
//! dir = "artifacts/setup_runs"
//!
//! [hot_reload]
//! interval_ms = 500
//!
//! [telemetry]
//! enabled = true
//! path = "artifacts/telemetry/events.jsonl"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name looked up under the project root.
pub const CONFIG_FILE_NAME: &str = "stagehand.toml";

/// Lower bound for the hot-reload poll interval.
pub const MIN_HOT_RELOAD_INTERVAL_MS: u64 = 200;

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub journal: JournalConfig,
    pub hot_reload: HotReloadConfig,
    pub tool_bus: ToolBusConfig,
    pub telemetry: TelemetryConfig,
    pub log: LogConfig,
}

/// Where run journals are written, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HotReloadConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolBusConfig {
    /// Topic on which orchestrator lifecycle events are published.
    pub events_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: "artifacts/setup_runs".to_string(),
        }
    }
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for ToolBusConfig {
    fn default() -> Self {
        Self {
            events_topic: "setup.events".to_string(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "artifacts/telemetry/events.jsonl".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration for the project rooted at `root`.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// if an environment variable holds an unparsable value, or if the merged
/// configuration fails validation.
pub fn load_config(root: &Path) -> Result<Config> {
    Config::load_with_env(root, |key| std::env::var(key).ok())
}

impl Config {
    /// Load configuration using `env` as the environment lookup.
    ///
    /// # Errors
    ///
    /// See [`load_config`].
    pub fn load_with_env<F>(root: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = root.join(CONFIG_FILE_NAME);
        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_vars(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file. Missing sections fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        toml::from_str(&content).map_err(|e| Error::toml_parse_failed(path, e.to_string()))
    }

    fn apply_env_vars<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // STAGEHAND_JOURNAL_DIR
        if let Some(value) = env("STAGEHAND_JOURNAL_DIR") {
            self.journal.dir = value;
        }

        // STAGEHAND_HOT_RELOAD_INTERVAL_MS
        if let Some(value) = env("STAGEHAND_HOT_RELOAD_INTERVAL_MS") {
            self.hot_reload.interval_ms = value.parse().map_err(|e| {
                Error::invalid_config(format!("Invalid STAGEHAND_HOT_RELOAD_INTERVAL_MS value: {e}"))
            })?;
        }

        // STAGEHAND_EVENTS_TOPIC
        if let Some(value) = env("STAGEHAND_EVENTS_TOPIC") {
            self.tool_bus.events_topic = value;
        }

        // STAGEHAND_TELEMETRY_ENABLED
        if let Some(value) = env("STAGEHAND_TELEMETRY_ENABLED") {
            self.telemetry.enabled = value.parse().map_err(|e| {
                Error::invalid_config(format!("Invalid STAGEHAND_TELEMETRY_ENABLED value: {e}"))
            })?;
        }

        // STAGEHAND_TELEMETRY_PATH
        if let Some(value) = env("STAGEHAND_TELEMETRY_PATH") {
            self.telemetry.path = value;
        }

        // STAGEHAND_LOG
        if let Some(value) = env("STAGEHAND_LOG") {
            self.log.filter = value;
        }

        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.hot_reload.interval_ms < MIN_HOT_RELOAD_INTERVAL_MS {
            return Err(Error::invalid_config(format!(
                "hot_reload.interval_ms must be at least {MIN_HOT_RELOAD_INTERVAL_MS}, got {}",
                self.hot_reload.interval_ms
            )));
        }
        if self.journal.dir.trim().is_empty() {
            return Err(Error::invalid_config("journal.dir must not be empty"));
        }
        if self.tool_bus.events_topic.trim().is_empty() {
            return Err(Error::invalid_config("tool_bus.events_topic must not be empty"));
        }
        if self.telemetry.enabled && self.telemetry.path.trim().is_empty() {
            return Err(Error::invalid_config(
                "telemetry.path must not be empty when telemetry is enabled",
            ));
        }
        Ok(())
    }

    /// Absolute journal directory for the project at `root`.
    #[must_use]
    pub fn journal_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.journal.dir)
    }

    /// Absolute telemetry event log for the project at `root`.
    #[must_use]
    pub fn telemetry_path(&self, root: &Path) -> PathBuf {
        root.join(&self.telemetry.path)
    }
}
