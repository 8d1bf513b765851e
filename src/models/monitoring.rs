//! Snapshot types published by the pollers.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::{SessionHealth, SessionMetadata, SessionProgress};
use super::session::SessionState;
use crate::config::MonitoringConfig;

/// Monitoring view of one session at one tick. Replaced wholesale every tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringUpdate {
    /// Session identifier.
    pub session_id: String,
    /// Owning project identifier.
    pub project_id: String,
    /// Detector classification.
    pub state: SessionState,
    /// Health facts used for the classification.
    pub health: SessionHealth,
    /// Progress counters.
    pub progress: SessionProgress,
    /// Identity and environment.
    pub metadata: SessionMetadata,
    /// When this update was produced; never earlier than `metadata.last_update_at`.
    pub timestamp: DateTime<Utc>,
}

/// Ordering used for every session list: most recently active first,
/// ties broken by session id.
#[must_use]
pub fn by_recent_activity(a: &MonitoringUpdate, b: &MonitoringUpdate) -> Ordering {
    b.health
        .last_activity_at
        .cmp(&a.health.last_activity_at)
        .then_with(|| a.session_id.cmp(&b.session_id))
}

/// Aggregate figures over a project's sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStats {
    /// Sessions classified `active`.
    pub active_count: usize,
    /// Sessions in the snapshot.
    pub total_count: usize,
    /// Mean of the reported response times, if any session reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_response_time: Option<f64>,
    /// `active_count / max_sessions`.
    pub load_estimate: f64,
}

impl MonitoringStats {
    /// Compute stats for a session list under the given fan-out bound.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Counts are far below 2^52.
    pub fn compute(sessions: &[MonitoringUpdate], max_sessions: u32) -> Self {
        let active_count = sessions
            .iter()
            .filter(|update| update.state == SessionState::Active)
            .count();
        let response_times: Vec<f64> = sessions
            .iter()
            .filter_map(|update| update.health.response_time)
            .collect();
        let mean_response_time = if response_times.is_empty() {
            None
        } else {
            Some(response_times.iter().sum::<f64>() / response_times.len() as f64)
        };

        Self {
            active_count,
            total_count: sessions.len(),
            mean_response_time,
            load_estimate: active_count as f64 / f64::from(max_sessions.max(1)),
        }
    }
}

/// Lifecycle status of a project monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MonitorStatus {
    /// Poller is running (possibly degraded).
    Running,
    /// Poller gave up after too many consecutive failures; needs an explicit restart.
    DetectionLost,
}

/// Complete monitoring view of one project, replaced atomically per tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringData {
    /// Project identifier.
    pub project_id: String,
    /// Sessions ordered most recently active first.
    pub sessions: Vec<MonitoringUpdate>,
    /// Aggregate figures.
    pub stats: MonitoringStats,
    /// Time of the last successful tick.
    pub last_updated: DateTime<Utc>,
    /// Config in effect when the snapshot was produced.
    pub config: MonitoringConfig,
    /// Monitor lifecycle status.
    pub status: MonitorStatus,
    /// Detection is limited: the latest tick(s) failed and data may be stale.
    pub degraded: bool,
    /// Whole-tick failures since the last successful tick.
    pub consecutive_failures: u32,
}

impl MonitoringData {
    /// Look up one session's update.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<&MonitoringUpdate> {
        self.sessions
            .iter()
            .find(|update| update.session_id == session_id)
    }
}
