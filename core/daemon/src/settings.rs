//! Runtime settings loaded from `<root>/daemon/settings.toml`.
//!
//! Every key is optional. A file that fails to parse is moved aside as
//! `settings.toml.corrupt-<timestamp>` and replaced with defaults so a bad
//! edit never keeps the daemon from starting.

use chrono::Utc;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub router: RouterSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub session: SessionSettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterSettings {
    pub dedupe_capacity: usize,
    /// Events processed before the router continues as new.
    pub continue_as_new_after: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            dedupe_capacity: flow_core::dedupe::DEFAULT_DEDUPE_CAPACITY,
            continue_as_new_after: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 10_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    pub activity_secs: u64,
    pub output_tail_secs: u64,
    pub spawn_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            activity_secs: 30,
            output_tail_secs: 10,
            spawn_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Lines of terminal output fetched for a bell without inline context.
    pub bell_output_lines: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            bell_output_lines: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceSettings {
    pub closed_retention_hours: u64,
    pub interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            closed_retention_hours: 24,
            interval_secs: 300,
        }
    }
}

impl DaemonSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            max_attempts: self.retry.max_attempts.max(1),
        }
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.activity_secs.max(1))
    }

    pub fn output_tail_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.output_tail_secs.max(1))
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.spawn_secs.max(1))
    }
}

/// Loads settings, falling back to defaults when the file is missing.
/// A corrupt file is quarantined and rewritten with defaults.
pub fn load_settings(path: &Path) -> DaemonSettings {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return DaemonSettings::default()
        }
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Failed to read daemon settings; using defaults");
            return DaemonSettings::default();
        }
    };

    match toml::from_str::<DaemonSettings>(&content) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "Daemon settings are invalid; quarantining and using defaults"
            );
            match quarantine_and_reset(path) {
                Ok(quarantined) => info!(
                    quarantined = %quarantined.display(),
                    "Corrupt settings moved aside"
                ),
                Err(err) => warn!(error = %err, "Failed to quarantine daemon settings"),
            }
            DaemonSettings::default()
        }
    }
}

fn quarantine_and_reset(path: &Path) -> Result<PathBuf, String> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| "Settings path has no file name".to_string())?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let quarantined = path.with_file_name(format!("{}.corrupt-{}", file_name, stamp));

    fs::rename(path, &quarantined)
        .map_err(|err| format!("Failed to move corrupt settings aside: {}", err))?;

    let defaults = toml::to_string_pretty(&DaemonSettings::default())
        .map_err(|err| format!("Failed to serialize default settings: {}", err))?;
    flow_core::atomic_write(path, defaults.as_bytes())
        .map_err(|err| format!("Failed to write default settings: {}", err))?;

    Ok(quarantined)
}
