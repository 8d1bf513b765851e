//! Global configuration parsing and monitoring config validation.
//!
//! Two layers live here:
//!
//! * [`GlobalConfig`] is the daemon's TOML file (bind address, projects
//!   root, defaults for new monitors, engine-wide detection tuning).
//! * [`MonitoringConfig`] / [`MonitoringConfigPatch`] are the per-project
//!   configuration exchanged over HTTP. Every field has a default and a
//!   patch is merged field by field, each field validated on its own.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Smallest accepted poll interval in milliseconds.
pub const MIN_POLL_INTERVAL_MS: u64 = 1000;

fn default_poll_interval() -> u64 {
    5_000
}

fn default_health_check_interval() -> u64 {
    30_000
}

fn default_stale_threshold() -> u64 {
    300_000
}

fn default_max_sessions() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Per-project monitoring configuration.
///
/// Intervals and thresholds are milliseconds. Serialized in camelCase for
/// the HTTP surface; snake_case keys are accepted as aliases so the same
/// struct can be written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Delay between poll ticks; never below [`MIN_POLL_INTERVAL_MS`].
    #[serde(default = "default_poll_interval", alias = "poll_interval")]
    pub poll_interval: u64,
    /// How often the poller re-enumerates the project's sessions.
    #[serde(
        default = "default_health_check_interval",
        alias = "health_check_interval"
    )]
    pub health_check_interval: u64,
    /// Inactivity beyond this marks a session `stalled`.
    #[serde(default = "default_stale_threshold", alias = "stale_threshold")]
    pub stale_threshold: u64,
    /// Upper bound on concurrent per-session fetches; at least 1.
    #[serde(default = "default_max_sessions", alias = "max_sessions")]
    pub max_sessions: u32,
    /// Nudge sessions that newly enter `stalled` or `error`.
    #[serde(default, alias = "enable_auto_recovery")]
    pub enable_auto_recovery: bool,
    /// Publish [`MonitorEvent`](crate::monitor::events::MonitorEvent)s for this project.
    #[serde(default = "default_true", alias = "enable_notifications")]
    pub enable_notifications: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            health_check_interval: default_health_check_interval(),
            stale_threshold: default_stale_threshold(),
            max_sessions: default_max_sessions(),
            enable_auto_recovery: false,
            enable_notifications: true,
        }
    }
}

/// Partial monitoring configuration; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MonitoringConfigPatch {
    /// New poll interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
    /// New session re-enumeration interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u64>,
    /// New stale threshold in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_threshold: Option<u64>,
    /// New fan-out bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<u32>,
    /// Toggle auto recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_auto_recovery: Option<bool>,
    /// Toggle event publication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_notifications: Option<bool>,
}

impl MonitoringConfigPatch {
    /// Validate only the fields this patch sets.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` if `poll_interval` is below
    /// [`MIN_POLL_INTERVAL_MS`] or `max_sessions` is zero.
    pub fn validate(&self) -> Result<()> {
        if let Some(poll) = self.poll_interval {
            validate_poll_interval(poll)?;
        }
        if let Some(max) = self.max_sessions {
            validate_max_sessions(max)?;
        }
        Ok(())
    }
}

fn validate_poll_interval(poll_interval: u64) -> Result<()> {
    if poll_interval < MIN_POLL_INTERVAL_MS {
        return Err(AppError::InvalidConfig(format!(
            "pollInterval must be at least {MIN_POLL_INTERVAL_MS}ms, got {poll_interval}ms"
        )));
    }
    Ok(())
}

fn validate_max_sessions(max_sessions: u32) -> Result<()> {
    if max_sessions < 1 {
        return Err(AppError::InvalidConfig(
            "maxSessions must be at least 1".into(),
        ));
    }
    Ok(())
}

impl MonitoringConfig {
    /// Check the invariants every effective config must hold.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` on a bad `poll_interval` or `max_sessions`.
    pub fn validate(&self) -> Result<()> {
        validate_poll_interval(self.poll_interval)?;
        validate_max_sessions(self.max_sessions)
    }

    /// Produce a new config with `patch` applied over `self`.
    ///
    /// The receiver is left untouched, so a failed merge never leaves a
    /// half-applied config behind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` if any supplied field is invalid.
    pub fn merge(&self, patch: &MonitoringConfigPatch) -> Result<Self> {
        patch.validate()?;
        let merged = Self {
            poll_interval: patch.poll_interval.unwrap_or(self.poll_interval),
            health_check_interval: patch
                .health_check_interval
                .unwrap_or(self.health_check_interval),
            stale_threshold: patch.stale_threshold.unwrap_or(self.stale_threshold),
            max_sessions: patch.max_sessions.unwrap_or(self.max_sessions),
            enable_auto_recovery: patch
                .enable_auto_recovery
                .unwrap_or(self.enable_auto_recovery),
            enable_notifications: patch
                .enable_notifications
                .unwrap_or(self.enable_notifications),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Session re-enumeration interval as a [`Duration`].
    #[must_use]
    pub fn health_check_period(&self) -> Duration {
        Duration::from_millis(self.health_check_interval)
    }

    /// Stale threshold as a [`Duration`].
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_threshold)
    }
}

fn default_failure_ceiling() -> u32 {
    5
}

fn default_backoff_ceiling() -> u32 {
    8
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_timeout_ms() -> u64 {
    3_000
}

/// Engine-wide detection tuning shared by every poller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DetectionSettings {
    /// Error-count increase per tick tolerated before a session is `error`.
    #[serde(default)]
    pub error_threshold: u64,
    /// Consecutive whole-tick failures before a monitor is `detectionLost`.
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    /// Backoff cap as a multiple of the poll interval.
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling: u32,
    /// How long `start_monitoring` waits for the first snapshot.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// How long a waited refresh may take before giving up.
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            error_threshold: 0,
            failure_ceiling: default_failure_ceiling(),
            backoff_ceiling: default_backoff_ceiling(),
            startup_timeout_ms: default_startup_timeout_ms(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
        }
    }
}

impl DetectionSettings {
    /// Startup wait as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Refresh wait as a [`Duration`].
    #[must_use]
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_ceiling == 0 {
            return Err(AppError::Config(
                "detection.failure_ceiling must be greater than zero".into(),
            ));
        }
        if self.backoff_ceiling == 0 {
            return Err(AppError::Config(
                "detection.backoff_ceiling must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_http_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    3000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the HTTP server binds to.
    #[serde(default = "default_http_host")]
    pub http_host: String,
    /// HTTP port; 0 lets the OS choose.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Directory holding one sub-directory of session transcripts per project.
    pub projects_root: PathBuf,
    /// Projects monitored from startup.
    #[serde(default)]
    pub autostart_projects: Vec<String>,
    /// Defaults applied to every new monitor.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Engine-wide detection tuning.
    #[serde(default)]
    pub detection: DetectionSettings,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or the projects root is
    /// missing, and `AppError::InvalidConfig` if the monitoring defaults
    /// are invalid.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the projects root, re-validating the new path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn set_projects_root(&mut self, root: impl AsRef<Path>) -> Result<()> {
        self.projects_root = canonical_root(root.as_ref())?;
        Ok(())
    }

    /// `host:port` string for the HTTP listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    fn validate(&mut self) -> Result<()> {
        self.monitoring.validate()?;
        self.detection.validate()?;

        if self.autostart_projects.iter().any(String::is_empty) {
            return Err(AppError::Config(
                "autostart_projects must not contain empty ids".into(),
            ));
        }

        self.projects_root = canonical_root(&self.projects_root)?;
        Ok(())
    }
}

fn canonical_root(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|err| AppError::Config(format!("projects_root invalid: {err}")))
}
