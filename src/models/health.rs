//! Raw per-session facts supplied by a health source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity and health signals for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    /// Most recent observed activity.
    pub last_activity_at: DateTime<Utc>,
    /// Mean response latency in milliseconds, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    /// Resident memory in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    /// CPU usage in percent, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    /// Monotonic error counter.
    #[serde(default)]
    pub error_count: u64,
    /// Ordered warnings attached by the source or the poller.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SessionHealth {
    /// Health with only an activity timestamp set.
    #[must_use]
    pub fn at(last_activity_at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at,
            response_time: None,
            memory_usage: None,
            cpu_usage: None,
            error_count: 0,
            warnings: Vec::new(),
        }
    }
}

/// Token counters for a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input: u64,
    /// Completion tokens.
    pub output: u64,
    /// `input + output` (sources may also count cache tokens here).
    pub total: u64,
}

impl TokenUsage {
    /// Usage with `total` derived from input and output.
    #[must_use]
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }
}

/// What the session is doing and how much it has done.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    /// Short descriptor of the current activity (tool name, message kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
    /// Token counters.
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Messages exchanged so far.
    #[serde(default)]
    pub message_count: u64,
    /// Wall time since the session started, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// Identity and environment of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Process id, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the session started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the source last refreshed these facts.
    pub last_update_at: DateTime<Utc>,
    /// Tool or agent version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Environment tag (working directory, host, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl SessionMetadata {
    /// Metadata with only the update timestamp set.
    #[must_use]
    pub fn at(last_update_at: DateTime<Utc>) -> Self {
        Self {
            pid: None,
            started_at: None,
            last_update_at,
            version: None,
            environment: None,
        }
    }
}

/// Everything a health source reports for one session in one fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionFacts {
    /// Activity and health signals.
    pub health: SessionHealth,
    /// Progress counters.
    pub progress: SessionProgress,
    /// Identity and environment.
    pub metadata: SessionMetadata,
}
