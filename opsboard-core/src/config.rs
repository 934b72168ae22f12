//! Tunable timing windows and spacing.
//!
//! # Storage layout
//!
//! ```text
//! ~/.opsboard/
//!   config.yaml   (optional; every field has a default)
//! ```
//!
//! The windows only shape perceived smoothness (echo suppression, post-save
//! protection, polling cadence); none of them is load-bearing for
//! correctness.
//!
//! Like the other path-based helpers, loading has an explicit-home form
//! (`load_at`) used by tests and a convenience form deriving home from
//! `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long an own drag event is treated as an echo.
    pub self_echo_window_ms: u64,
    /// How long after a committed save stale events for saved orders are blocked.
    pub protection_window_ms: u64,
    /// Signal poll cadence for non-privileged viewers.
    pub viewer_poll_interval_ms: u64,
    /// Signal poll cadence for privileged editors.
    pub editor_poll_interval_ms: u64,
    /// Inbound events arriving within one tick are merged before a re-sort.
    pub batch_tick_ms: u64,
    /// Spacing between manual positions.
    pub sort_gap: i64,
    /// How long a local correlation id is remembered for echo matching.
    pub correlation_ttl_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            self_echo_window_ms: 5_000,
            protection_window_ms: 3_000,
            viewer_poll_interval_ms: 10_000,
            editor_poll_interval_ms: 30_000,
            batch_tick_ms: 50,
            sort_gap: 10,
            correlation_ttl_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn self_echo_window(&self) -> Duration {
        Duration::from_millis(self.self_echo_window_ms)
    }

    pub fn protection_window(&self) -> Duration {
        Duration::from_millis(self.protection_window_ms)
    }

    pub fn batch_tick(&self) -> Duration {
        Duration::from_millis(self.batch_tick_ms)
    }

    pub fn correlation_ttl(&self) -> Duration {
        Duration::from_millis(self.correlation_ttl_ms)
    }

    /// Privileged editors mostly see their own changes and poll less often.
    pub fn signal_poll_interval(&self, privileged: bool) -> Duration {
        if privileged {
            Duration::from_millis(self.editor_poll_interval_ms)
        } else {
            Duration::from_millis(self.viewer_poll_interval_ms)
        }
    }
}

/// `<home>/.opsboard/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".opsboard").join("config.yaml")
}

/// Load the config under `home`. A missing file yields defaults.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path()).ends_with(".opsboard/config.yaml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        assert_eq!(load_at(home.path()).expect("load"), SyncConfig::default());
    }

    #[test]
    fn poll_interval_depends_on_privilege() {
        let config = SyncConfig::default();
        assert!(config.signal_poll_interval(false) < config.signal_poll_interval(true));
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
