//! Per-project polling loop.
//!
//! A [`ProjectPoller`] owns one tokio task. Each tick enumerates the
//! project's sessions (at most once per health-check interval unless a
//! refresh forced it), fetches facts for every session with bounded
//! concurrency, classifies each one and publishes a complete
//! [`MonitoringData`]. Ticks are strictly serialized; refresh requests
//! that arrive mid-tick collapse into one follow-up tick.
//!
//! Whole-tick failures back off exponentially (capped at
//! `backoff_ceiling × poll_interval`) and flag the snapshot as degraded.
//! After `failure_ceiling` consecutive failures the entry is marked
//! `detectionLost` and the loop exits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::detector::{detect, DetectionInput, Observation};
use super::events::MonitorEvent;
use super::intents::IntentKind;
use super::registry::MonitorEntry;
use crate::config::{DetectionSettings, MonitoringConfig};
use crate::models::health::{SessionFacts, SessionHealth, SessionMetadata, SessionProgress};
use crate::models::monitoring::{
    by_recent_activity, MonitorStatus, MonitoringData, MonitoringStats, MonitoringUpdate,
};
use crate::models::session::SessionState;
use crate::source::{HealthSource, SourceCommand};
use crate::AppError;

/// Warnings kept per session; older ones are dropped first.
const MAX_WARNINGS: usize = 20;

/// Why the poller woke up between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Timer,
    Refresh,
    Cancelled,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Published,
    Failed,
    Lost,
}

/// Delay before the next tick given the current failure streak.
///
/// `poll_interval` with no failures, then doubling per failure, never
/// more than `poll_interval × backoff_ceiling`.
#[must_use]
pub fn backoff_delay(poll_interval: Duration, failures: u32, backoff_ceiling: u32) -> Duration {
    if failures == 0 {
        return poll_interval;
    }
    let factor = 1u32
        .checked_shl(failures)
        .unwrap_or(u32::MAX)
        .min(backoff_ceiling.max(1));
    poll_interval.saturating_mul(factor)
}

/// Scheduling loop for one monitored project.
pub(crate) struct ProjectPoller {
    entry: Arc<MonitorEntry>,
    source: Arc<dyn HealthSource>,
    settings: DetectionSettings,
    events: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
    config_rx: watch::Receiver<MonitoringConfig>,
    sessions: Vec<String>,
    last_enumeration: Option<Instant>,
    baselines: HashMap<String, Observation>,
    previous: HashMap<String, MonitoringUpdate>,
    /// Errors the poller itself added for failed fetches, per session.
    failure_errors: HashMap<String, u64>,
    consecutive_failures: u32,
}

impl ProjectPoller {
    pub(crate) fn new(
        entry: Arc<MonitorEntry>,
        source: Arc<dyn HealthSource>,
        settings: DetectionSettings,
        events: broadcast::Sender<MonitorEvent>,
        cancel: CancellationToken,
    ) -> Self {
        // A respawned poller keeps serving the last snapshot's values for
        // sessions it cannot fetch.
        let previous = entry
            .snapshot()
            .map(|data| {
                data.sessions
                    .iter()
                    .map(|update| (update.session_id.clone(), update.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let config_rx = entry.config_receiver();

        Self {
            entry,
            source,
            settings,
            events,
            cancel,
            config_rx,
            sessions: Vec::new(),
            last_enumeration: None,
            baselines: HashMap::new(),
            previous,
            failure_errors: HashMap::new(),
            consecutive_failures: 0,
        }
    }

    /// Run ticks until cancelled or detection is lost.
    pub(crate) async fn run(mut self) {
        let mut forced = true;
        loop {
            let tick_started = Instant::now();
            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("poller cancelled mid-tick");
                    return;
                }
                outcome = self.tick(forced) => outcome,
            };

            if outcome == TickOutcome::Lost {
                return;
            }

            forced = match self.wait_next(tick_started).await {
                Wake::Cancelled => {
                    debug!("poller cancelled");
                    return;
                }
                Wake::Refresh => true,
                Wake::Timer => false,
            };
        }
    }

    fn current_delay(&self) -> Duration {
        backoff_delay(
            self.config_rx.borrow().poll_period(),
            self.consecutive_failures,
            self.settings.backoff_ceiling,
        )
    }

    /// Sleep until the next tick is due, a refresh is requested, or the
    /// poller is cancelled. A config change that shortens the delay moves
    /// the deadline forward; a longer delay waits for the next tick.
    async fn wait_next(&mut self, tick_started: Instant) -> Wake {
        let mut period = self.current_delay();
        loop {
            let deadline = tick_started + period;
            tokio::select! {
                () = self.cancel.cancelled() => return Wake::Cancelled,
                () = tokio::time::sleep_until(deadline) => return Wake::Timer,
                () = self.entry.refresh_signal().notified() => return Wake::Refresh,
                changed = self.config_rx.changed() => {
                    if changed.is_err() {
                        return Wake::Cancelled;
                    }
                    let updated = self.current_delay();
                    if updated < period {
                        debug!(delay_ms = updated.as_millis(), "poll interval shortened; rescheduling");
                        period = updated;
                    }
                }
            }
        }
    }

    async fn tick(&mut self, forced: bool) -> TickOutcome {
        let seq = self.entry.begin_tick();
        let outcome = self.run_tick(forced).await;
        self.entry.finish_tick(seq);
        outcome
    }

    async fn run_tick(&mut self, forced: bool) -> TickOutcome {
        let config = self.config_rx.borrow_and_update().clone();
        let project_id = self.entry.project_id().to_owned();

        let due = self
            .last_enumeration
            .is_none_or(|at| at.elapsed() >= config.health_check_period());
        if forced || due {
            match self.source.list_sessions(&project_id).await {
                Ok(sessions) => {
                    let listed: HashSet<&str> = sessions.iter().map(String::as_str).collect();
                    self.entry.lock_state().intents.retain_sessions(&listed);
                    self.sessions = sessions;
                    self.last_enumeration = Some(Instant::now());
                }
                Err(err) => {
                    self.last_enumeration = None;
                    return self.record_failure(&config, &err);
                }
            }
        }

        let (intents, hidden) = {
            let state = self.entry.lock_state();
            (state.intents.kinds(), state.intents.hidden())
        };
        let targets: Vec<String> = self
            .sessions
            .iter()
            .filter(|id| !hidden.contains(*id))
            .cloned()
            .collect();

        let concurrency = usize::try_from(config.max_sessions).unwrap_or(1).max(1);
        let source = &self.source;
        let project = project_id.as_str();
        let fetched: Vec<(String, crate::Result<SessionFacts>)> = stream::iter(targets)
            .map(|session_id| async move {
                let result = source.fetch_facts(project, &session_id).await;
                (session_id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let produced_at = Utc::now();
        let mut sessions = Vec::with_capacity(fetched.len());
        for (session_id, result) in fetched {
            let intent = intents.get(&session_id).copied();
            let update = match result {
                Ok(facts) => self.classify(&project_id, &session_id, facts, intent, &config, produced_at),
                Err(err) => self.degrade_session(&project_id, &session_id, intent, &err, produced_at),
            };
            sessions.push(update);
        }
        sessions.sort_by(by_recent_activity);

        let terminated: Vec<&str> = sessions
            .iter()
            .filter(|update| update.state == SessionState::Terminated)
            .map(|update| update.session_id.as_str())
            .collect();
        if !terminated.is_empty() {
            self.entry.lock_state().intents.note_published(terminated);
        }

        let transitions = self.collect_transitions(&sessions);
        let recovered = self.consecutive_failures > 0;
        self.consecutive_failures = 0;

        let seen: HashSet<&str> = sessions.iter().map(|u| u.session_id.as_str()).collect();
        self.baselines.retain(|id, _| seen.contains(id.as_str()));
        self.failure_errors.retain(|id, _| seen.contains(id.as_str()));
        self.previous = sessions
            .iter()
            .map(|update| (update.session_id.clone(), update.clone()))
            .collect();

        let data = MonitoringData {
            project_id: project_id.clone(),
            stats: MonitoringStats::compute(&sessions, config.max_sessions),
            sessions,
            last_updated: produced_at,
            config: config.clone(),
            status: MonitorStatus::Running,
            degraded: false,
            consecutive_failures: 0,
        };
        debug!(
            sessions = data.stats.total_count,
            active = data.stats.active_count,
            "snapshot published"
        );
        self.entry.publish(data);

        if recovered {
            info!(%project_id, "detection recovered");
            self.emit(&config, MonitorEvent::Recovered { project_id: project_id.clone() });
        }
        for (session_id, from, to) in transitions {
            self.emit(
                &config,
                MonitorEvent::StateChanged {
                    project_id: project_id.clone(),
                    session_id: session_id.clone(),
                    from,
                    to,
                },
            );
            if config.enable_auto_recovery && matches!(to, SessionState::Stalled | SessionState::Error) {
                self.auto_recover(&config, &project_id, &session_id, to).await;
            }
        }

        TickOutcome::Published
    }

    fn classify(
        &mut self,
        project_id: &str,
        session_id: &str,
        facts: SessionFacts,
        intent: Option<IntentKind>,
        config: &MonitoringConfig,
        now: DateTime<Utc>,
    ) -> MonitoringUpdate {
        let state = detect(&DetectionInput {
            health: &facts.health,
            progress: &facts.progress,
            previous: self.baselines.get(session_id),
            intent,
            now,
            stale_threshold: config.stale_after(),
            poll_interval: config.poll_period(),
            error_threshold: self.settings.error_threshold,
        });
        self.baselines.insert(
            session_id.to_owned(),
            Observation::of(&facts.health, &facts.progress),
        );

        // The published count never drops below what earlier ticks showed,
        // including errors added for failed fetches.
        let mut health = facts.health;
        let added = self.failure_errors.get(session_id).copied().unwrap_or(0);
        let floor = self
            .previous
            .get(session_id)
            .map_or(0, |previous| previous.health.error_count);
        health.error_count = health.error_count.saturating_add(added).max(floor);

        let mut metadata = facts.metadata;
        if metadata.last_update_at > now {
            metadata.last_update_at = now;
        }

        MonitoringUpdate {
            session_id: session_id.to_owned(),
            project_id: project_id.to_owned(),
            state,
            health,
            progress: facts.progress,
            metadata,
            timestamp: now,
        }
    }

    /// Build an `error` entry for a session whose facts could not be fetched,
    /// keeping the previous tick's values where there are any.
    fn degrade_session(
        &mut self,
        project_id: &str,
        session_id: &str,
        intent: Option<IntentKind>,
        err: &AppError,
        now: DateTime<Utc>,
    ) -> MonitoringUpdate {
        warn!(project_id, session_id, %err, "session detection failed");

        let (mut health, progress, metadata) = match self.previous.get(session_id) {
            Some(previous) => (
                previous.health.clone(),
                previous.progress.clone(),
                previous.metadata.clone(),
            ),
            None => (
                SessionHealth::at(DateTime::<Utc>::default()),
                SessionProgress::default(),
                SessionMetadata::at(now),
            ),
        };
        health.error_count = health.error_count.saturating_add(1);
        let added = self.failure_errors.entry(session_id.to_owned()).or_insert(0);
        *added = added.saturating_add(1);
        health.warnings.push(format!("detection failed: {err}"));
        if health.warnings.len() > MAX_WARNINGS {
            let excess = health.warnings.len() - MAX_WARNINGS;
            health.warnings.drain(..excess);
        }

        MonitoringUpdate {
            session_id: session_id.to_owned(),
            project_id: project_id.to_owned(),
            state: intent.map_or(SessionState::Error, IntentKind::state),
            health,
            progress,
            metadata,
            timestamp: now,
        }
    }

    fn collect_transitions(
        &self,
        sessions: &[MonitoringUpdate],
    ) -> Vec<(String, Option<SessionState>, SessionState)> {
        sessions
            .iter()
            .filter_map(|update| {
                let from = self.previous.get(&update.session_id).map(|p| p.state);
                (from != Some(update.state)).then(|| (update.session_id.clone(), from, update.state))
            })
            .collect()
    }

    fn record_failure(&mut self, config: &MonitoringConfig, err: &AppError) -> TickOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;
        let project_id = self.entry.project_id().to_owned();
        let lost = failures >= self.settings.failure_ceiling;
        warn!(%project_id, failures, %err, "monitoring tick failed");

        let status = if lost {
            MonitorStatus::DetectionLost
        } else {
            MonitorStatus::Running
        };
        let data = match self.entry.snapshot() {
            Some(previous) => MonitoringData {
                config: config.clone(),
                status,
                degraded: true,
                consecutive_failures: failures,
                ..(*previous).clone()
            },
            None => MonitoringData {
                project_id: project_id.clone(),
                sessions: Vec::new(),
                stats: MonitoringStats::default(),
                last_updated: self.entry.created_at(),
                config: config.clone(),
                status,
                degraded: true,
                consecutive_failures: failures,
            },
        };
        self.entry.publish(data);

        if lost {
            self.entry.mark_lost();
            warn!(%project_id, failures, "failure ceiling reached; poller stopping");
            self.emit(config, MonitorEvent::DetectionLost { project_id });
            TickOutcome::Lost
        } else {
            self.emit(config, MonitorEvent::Degraded { project_id, failures });
            TickOutcome::Failed
        }
    }

    async fn auto_recover(
        &self,
        config: &MonitoringConfig,
        project_id: &str,
        session_id: &str,
        state: SessionState,
    ) {
        match self
            .source
            .apply_control(project_id, session_id, SourceCommand::Nudge)
            .await
        {
            Ok(()) => self.emit(
                config,
                MonitorEvent::AutoRecovery {
                    project_id: project_id.to_owned(),
                    session_id: session_id.to_owned(),
                    state,
                },
            ),
            Err(err) => warn!(project_id, session_id, %err, "auto-recovery nudge failed"),
        }
    }

    fn emit(&self, config: &MonitoringConfig, event: MonitorEvent) {
        if config.enable_notifications {
            let _ = self.events.send(event);
        }
    }
}
