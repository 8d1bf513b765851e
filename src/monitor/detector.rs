//! Session state derivation.
//!
//! [`detect`] is a pure function: given one session's latest facts, what
//! the previous tick saw, any recorded operator intent and the configured
//! thresholds, it returns the session's [`SessionState`]. Rules are
//! evaluated in order and the first match wins:
//!
//! 1. terminate intent → `terminated`
//! 2. pause intent → `paused`
//! 3. inactive longer than the stale threshold → `stalled`
//! 4. error count grew by more than the error threshold → `error`
//! 5. tokens, messages or activity advanced since the previous tick → `active`
//! 6. otherwise → `idle`

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::health::{SessionHealth, SessionProgress};
use crate::models::session::SessionState;

use super::intents::IntentKind;

/// What the previous tick recorded for a session; the baseline for deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Error counter at the previous tick.
    pub error_count: u64,
    /// Total tokens at the previous tick.
    pub total_tokens: u64,
    /// Message count at the previous tick.
    pub message_count: u64,
    /// Last activity at the previous tick.
    pub last_activity_at: DateTime<Utc>,
}

impl Observation {
    /// Record the baseline for the next tick.
    #[must_use]
    pub fn of(health: &SessionHealth, progress: &SessionProgress) -> Self {
        Self {
            error_count: health.error_count,
            total_tokens: progress.token_usage.total,
            message_count: progress.message_count,
            last_activity_at: health.last_activity_at,
        }
    }
}

/// Inputs for one classification.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    /// Latest health facts.
    pub health: &'a SessionHealth,
    /// Latest progress counters.
    pub progress: &'a SessionProgress,
    /// Baseline from the previous tick, if the session was seen before.
    pub previous: Option<&'a Observation>,
    /// Outstanding operator intent.
    pub intent: Option<IntentKind>,
    /// Classification time.
    pub now: DateTime<Utc>,
    /// Inactivity beyond this is `stalled`.
    pub stale_threshold: Duration,
    /// Poll interval; bounds "recent" activity for first sightings.
    pub poll_interval: Duration,
    /// Error-count growth tolerated per tick.
    pub error_threshold: u64,
}

/// Classify one session.
#[must_use]
pub fn detect(input: &DetectionInput<'_>) -> SessionState {
    match input.intent {
        Some(IntentKind::Terminate) => return SessionState::Terminated,
        Some(IntentKind::Pause) => return SessionState::Paused,
        None => {}
    }

    let idle_for = idle_duration(input.health.last_activity_at, input.now);
    if idle_for > input.stale_threshold {
        return SessionState::Stalled;
    }

    if let Some(previous) = input.previous {
        let new_errors = input.health.error_count.saturating_sub(previous.error_count);
        if new_errors > input.error_threshold {
            return SessionState::Error;
        }

        let advanced = input.progress.token_usage.total > previous.total_tokens
            || input.progress.message_count > previous.message_count
            || input.health.last_activity_at > previous.last_activity_at;
        if advanced {
            return SessionState::Active;
        }
        return SessionState::Idle;
    }

    if idle_for <= input.poll_interval {
        SessionState::Active
    } else {
        SessionState::Idle
    }
}

/// Time since `last_activity_at`; zero for timestamps in the future.
fn idle_duration(last_activity_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last_activity_at).to_std().unwrap_or(Duration::ZERO)
}
