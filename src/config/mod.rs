//! Configuration module for FaceFilter Live
//!
//! This module handles:
//! - Runtime tuning (`config.toml`): arena size, tick and timeout intervals,
//!   restart budget
//! - The userdata directory layout shared by settings, the stage state
//!   database, the output sequence and log files
//!
//! # Userdata Location
//!
//! Unless overridden on the command line, userdata lives in the
//! platform-appropriate data directory under `dev.facefilter.live`:
//! - **Linux**: `~/.local/share/dev.facefilter.live/`
//! - **macOS**: `~/Library/Application Support/dev.facefilter.live/`
//! - **Windows**: `%APPDATA%\dev.facefilter.live\`
//!
//! # Layout
//!
//! - `settings/config.toml` - [`AppConfig`]
//! - `settings/states.json` - per-stage persisted state
//! - `output_sequence/` - PNG frames saved by the output stage
//! - `logs/` - daily rolling log files

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.facefilter.live";

pub const SETTINGS_DIR: &str = "settings";
pub const CONFIG_FILE: &str = "config.toml";
pub const STATES_FILE: &str = "states.json";
pub const OUTPUT_SEQUENCE_DIR: &str = "output_sequence";
pub const LOGS_DIR: &str = "logs";

/// Default arena size (2 GiB)
pub const DEFAULT_HEAP_SIZE_MB: usize = 2048;

// ==================== Userdata Paths ====================

/// Paths derived from the userdata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDataPaths {
    root: PathBuf,
}

impl UserDataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The platform data directory, if one can be determined.
    pub fn default_root() -> Option<PathBuf> {
        dirs_next::data_dir().map(|p| p.join(APP_ID))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root.join(SETTINGS_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.settings_dir().join(CONFIG_FILE)
    }

    pub fn states_file(&self) -> PathBuf {
        self.settings_dir().join(STATES_FILE)
    }

    pub fn output_sequence_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_SEQUENCE_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Create every directory in the layout.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.settings_dir(), self.output_sequence_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                LiveError::Config(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }
}

// ==================== App Config ====================

/// Runtime tuning loaded from `settings/config.toml`.
///
/// Every field has a default, so a partial or missing file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Capacity of the shared frame arena in MiB
    #[serde(default = "default_heap_size_mb")]
    pub heap_size_mb: usize,

    /// Interval of the supervising message loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long a stage waits for an input packet per tick
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Sleep while the output connection is full
    #[serde(default = "default_backpressure_sleep_ms")]
    pub backpressure_sleep_ms: u64,

    /// Minimum delay between background state flushes
    #[serde(default = "default_db_flush_interval_ms")]
    pub db_flush_interval_ms: u64,

    /// Automatic restarts allowed after a stage crash
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Queued packets at which an output connection counts as full
    #[serde(default = "default_output_queue_depth")]
    pub output_queue_depth: usize,
}

fn default_heap_size_mb() -> usize {
    DEFAULT_HEAP_SIZE_MB
}

fn default_tick_interval_ms() -> u64 {
    5
}

fn default_read_timeout_ms() -> u64 {
    5
}

fn default_backpressure_sleep_ms() -> u64 {
    1
}

fn default_db_flush_interval_ms() -> u64 {
    1000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_output_queue_depth() -> usize {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            heap_size_mb: default_heap_size_mb(),
            tick_interval_ms: default_tick_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            backpressure_sleep_ms: default_backpressure_sleep_ms(),
            db_flush_interval_ms: default_db_flush_interval_ms(),
            max_restarts: default_max_restarts(),
            output_queue_depth: default_output_queue_depth(),
        }
    }
}

impl AppConfig {
    /// Load the config file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LiveError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| LiveError::Config(format!("Failed to parse config {:?}: {}", path, e)))
    }

    /// Load the config, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LiveError::Config(format!("Failed to create settings directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LiveError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| LiveError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    pub fn heap_size_bytes(&self) -> usize {
        self.heap_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_millis(self.db_flush_interval_ms)
    }

    /// Per-stage polling parameters.
    pub fn worker_timing(&self) -> WorkerTiming {
        WorkerTiming {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            backpressure_sleep: Duration::from_millis(self.backpressure_sleep_ms),
            output_queue_depth: self.output_queue_depth.max(1),
        }
    }
}

/// Polling parameters shared by every stage worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    pub read_timeout: Duration,
    pub backpressure_sleep: Duration,
    pub output_queue_depth: usize,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        AppConfig::default().worker_timing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.heap_size_mb, 2048);
        assert_eq!(config.tick_interval(), Duration::from_millis(5));
        assert_eq!(config.max_restarts, 3);
        assert_eq!(config.worker_timing().output_queue_depth, 1);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "heap_size_mb = 64\nmax_restarts = 0\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.heap_size_mb, 64);
        assert_eq!(config.max_restarts, 0);
        assert_eq!(config.read_timeout_ms, 5);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings").join("config.toml");
        let config = AppConfig {
            heap_size_mb: 16,
            output_queue_depth: 4,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "heap_size_mb = \"lots\"").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(LiveError::Config(_))));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn test_userdata_layout() {
        let dir = TempDir::new().unwrap();
        let paths = UserDataPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.settings_dir().is_dir());
        assert!(paths.output_sequence_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert_eq!(paths.states_file(), dir.path().join("settings").join("states.json"));
    }
}
