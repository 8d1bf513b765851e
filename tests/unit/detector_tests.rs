//! Rule ordering and thresholds of the session state detector.

use std::time::Duration;

use chrono::{DateTime, Utc};

use session_monitor::models::health::{SessionHealth, SessionProgress, TokenUsage};
use session_monitor::models::session::SessionState;
use session_monitor::monitor::detector::{detect, DetectionInput, Observation};
use session_monitor::monitor::intents::IntentKind;

const STALE: Duration = Duration::from_secs(300);
const POLL: Duration = Duration::from_secs(5);

fn progress(tokens: u64, messages: u64) -> SessionProgress {
    SessionProgress {
        current_activity: Some("Bash".into()),
        token_usage: TokenUsage::new(tokens, 0),
        message_count: messages,
        elapsed_ms: 0,
    }
}

fn health(last_activity_at: DateTime<Utc>, errors: u64) -> SessionHealth {
    SessionHealth {
        error_count: errors,
        ..SessionHealth::at(last_activity_at)
    }
}

fn classify(
    health: &SessionHealth,
    progress: &SessionProgress,
    previous: Option<&Observation>,
    intent: Option<IntentKind>,
    now: DateTime<Utc>,
) -> SessionState {
    detect(&DetectionInput {
        health,
        progress,
        previous,
        intent,
        now,
        stale_threshold: STALE,
        poll_interval: POLL,
        error_threshold: 0,
    })
}

#[test]
fn terminate_intent_wins_over_everything() {
    let now = Utc::now();
    let h = health(now - chrono::Duration::hours(2), 50);
    let p = progress(10, 1);
    assert_eq!(
        classify(&h, &p, None, Some(IntentKind::Terminate), now),
        SessionState::Terminated
    );
}

#[test]
fn pause_intent_wins_over_activity() {
    let now = Utc::now();
    let h = health(now, 0);
    let p = progress(100, 5);
    let previous = Observation::of(&health(now - chrono::Duration::seconds(10), 0), &progress(1, 1));
    assert_eq!(
        classify(&h, &p, Some(&previous), Some(IntentKind::Pause), now),
        SessionState::Paused
    );
}

#[test]
fn stale_beats_error_spike() {
    let now = Utc::now();
    let h = health(now - chrono::Duration::minutes(10), 5);
    let p = progress(10, 1);
    let previous = Observation::of(&health(h.last_activity_at, 0), &p);
    assert_eq!(
        classify(&h, &p, Some(&previous), None, now),
        SessionState::Stalled
    );
}

#[test]
fn stale_on_first_sighting() {
    let now = Utc::now();
    let h = health(now - chrono::Duration::minutes(10), 0);
    let p = progress(10, 1);
    assert_eq!(classify(&h, &p, None, None, now), SessionState::Stalled);
}

#[test]
fn error_growth_above_threshold_is_error() {
    let now = Utc::now();
    let p = progress(10, 1);
    let previous = Observation::of(&health(now, 1), &p);
    let h = health(now, 2);
    assert_eq!(
        classify(&h, &p, Some(&previous), None, now),
        SessionState::Error
    );
}

#[test]
fn error_growth_within_threshold_is_tolerated() {
    let now = Utc::now();
    let p = progress(10, 1);
    let previous = Observation::of(&health(now, 1), &p);
    let h = health(now, 3);
    let state = detect(&DetectionInput {
        health: &h,
        progress: &p,
        previous: Some(&previous),
        intent: None,
        now,
        stale_threshold: STALE,
        poll_interval: POLL,
        error_threshold: 2,
    });
    assert_eq!(state, SessionState::Idle);
}

#[test]
fn token_growth_is_active() {
    let now = Utc::now();
    let at = now - chrono::Duration::seconds(30);
    let previous = Observation::of(&health(at, 0), &progress(10, 1));
    let h = health(at, 0);
    assert_eq!(
        classify(&h, &progress(20, 1), Some(&previous), None, now),
        SessionState::Active
    );
}

#[test]
fn message_growth_is_active() {
    let now = Utc::now();
    let at = now - chrono::Duration::seconds(30);
    let previous = Observation::of(&health(at, 0), &progress(10, 1));
    assert_eq!(
        classify(&health(at, 0), &progress(10, 2), Some(&previous), None, now),
        SessionState::Active
    );
}

#[test]
fn newer_activity_timestamp_is_active() {
    let now = Utc::now();
    let previous = Observation::of(
        &health(now - chrono::Duration::seconds(30), 0),
        &progress(10, 1),
    );
    assert_eq!(
        classify(&health(now, 0), &progress(10, 1), Some(&previous), None, now),
        SessionState::Active
    );
}

#[test]
fn unchanged_counters_are_idle() {
    let now = Utc::now();
    let at = now - chrono::Duration::seconds(30);
    let p = progress(10, 1);
    let previous = Observation::of(&health(at, 0), &p);
    assert_eq!(
        classify(&health(at, 0), &p, Some(&previous), None, now),
        SessionState::Idle
    );
}

#[test]
fn first_sighting_with_recent_activity_is_active() {
    let now = Utc::now();
    let h = health(now - chrono::Duration::seconds(2), 0);
    assert_eq!(
        classify(&h, &progress(10, 1), None, None, now),
        SessionState::Active
    );
}

#[test]
fn first_sighting_with_errors_is_not_error() {
    let now = Utc::now();
    let h = health(now, 7);
    assert_eq!(
        classify(&h, &progress(10, 1), None, None, now),
        SessionState::Active
    );
}
