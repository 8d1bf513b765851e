//! Shared fixtures for engine-level integration tests.
//!
//! [`ScriptedSource`] is an in-memory `HealthSource` whose sessions are
//! driven by a per-session [`Script`]; tests flip scripts between ticks
//! to simulate activity, silence and failures.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use session_monitor::config::{DetectionSettings, MonitoringConfig};
use session_monitor::models::health::{
    SessionFacts, SessionHealth, SessionMetadata, SessionProgress, TokenUsage,
};
use session_monitor::models::monitoring::MonitoringData;
use session_monitor::monitor::MonitoringContext;
use session_monitor::source::{HealthSource, SourceCommand};
use session_monitor::{AppError, Result};

pub const PROJECT: &str = "proj";

/// How a scripted session answers `fetch_facts`.
#[derive(Debug, Clone)]
pub enum Script {
    /// Activity right now and growing token counts on every fetch.
    Live,
    /// Frozen counters with the given last activity.
    Quiet(DateTime<Utc>),
    /// Fetch fails.
    Failing,
}

#[derive(Default)]
pub struct ScriptedSource {
    sessions: Mutex<BTreeMap<String, Script>>,
    fail_listing: AtomicBool,
    fail_control: AtomicBool,
    fail_command: Mutex<Option<SourceCommand>>,
    list_delay_ms: AtomicU64,
    control_delay_ms: AtomicU64,
    tokens: AtomicU64,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    commands: Mutex<Vec<(String, SourceCommand)>>,
}

impl ScriptedSource {
    pub fn with_sessions(sessions: &[(&str, Script)]) -> Arc<Self> {
        let source = Self::default();
        for (id, script) in sessions {
            source.set(id, script.clone());
        }
        Arc::new(source)
    }

    pub fn set(&self, session_id: &str, script: Script) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_owned(), script);
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_control(&self, fail: bool) {
        self.fail_control.store(fail, Ordering::SeqCst);
    }

    /// Fail only control commands equal to `command`.
    pub fn fail_on(&self, command: SourceCommand) {
        *self.fail_command.lock().unwrap() = Some(command);
    }

    pub fn set_control_delay(&self, delay: Duration) {
        self.control_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.list_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<(String, SourceCommand)> {
        self.commands.lock().unwrap().clone()
    }

    fn facts(&self, script: &Script) -> Result<SessionFacts> {
        let (last_activity_at, total) = match script {
            Script::Live => (Utc::now(), self.tokens.fetch_add(10, Ordering::SeqCst) + 10),
            Script::Quiet(at) => (*at, 10),
            Script::Failing => {
                return Err(AppError::DetectionFailure("transcript unreadable".into()))
            }
        };
        Ok(SessionFacts {
            health: SessionHealth::at(last_activity_at),
            progress: SessionProgress {
                current_activity: Some("Bash".into()),
                token_usage: TokenUsage::new(total, 0),
                message_count: 1,
                elapsed_ms: 0,
            },
            metadata: SessionMetadata::at(last_activity_at),
        })
    }
}

impl HealthSource for ScriptedSource {
    fn list_sessions(
        &self,
        _project_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.list_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(AppError::DetectionFailure("project unreadable".into()));
            }
            Ok(self.sessions.lock().unwrap().keys().cloned().collect())
        })
    }

    fn fetch_facts(
        &self,
        _project_id: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionFacts>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let script = self.sessions.lock().unwrap().get(&session_id).cloned();
            match script {
                Some(script) => self.facts(&script),
                None => Err(AppError::DetectionFailure(format!("{session_id} vanished"))),
            }
        })
    }

    fn apply_control(
        &self,
        _project_id: &str,
        session_id: &str,
        command: SourceCommand,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let delay = self.control_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let targeted = *self.fail_command.lock().unwrap() == Some(command);
            if targeted || self.fail_control.load(Ordering::SeqCst) {
                return Err(AppError::DetectionFailure("session unreachable".into()));
            }
            self.commands.lock().unwrap().push((session_id, command));
            Ok(())
        })
    }
}

/// Monitor defaults with a long poll interval so only explicit refreshes
/// and the first tick run unless a test advances time.
pub fn quiet_defaults() -> MonitoringConfig {
    MonitoringConfig {
        poll_interval: 60_000,
        ..MonitoringConfig::default()
    }
}

pub fn test_settings() -> DetectionSettings {
    DetectionSettings {
        failure_ceiling: 3,
        backoff_ceiling: 4,
        ..DetectionSettings::default()
    }
}

pub fn test_context(source: &Arc<ScriptedSource>) -> Arc<MonitoringContext> {
    Arc::new(MonitoringContext::new(
        Arc::clone(source) as Arc<dyn HealthSource>,
        quiet_defaults(),
        test_settings(),
    ))
}

/// Wait until the project's snapshot satisfies `pred`.
pub async fn wait_for_snapshot(
    ctx: &MonitoringContext,
    project_id: &str,
    pred: impl Fn(&MonitoringData) -> bool,
) -> Arc<MonitoringData> {
    let mut rx = ctx.subscribe(project_id).expect("project monitored");
    let wait = async {
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(data) = current {
                if pred(&data) {
                    return data;
                }
            }
            rx.changed().await.expect("snapshot channel open");
        }
    };
    tokio::time::timeout(Duration::from_secs(3600), wait)
        .await
        .expect("snapshot condition reached")
}
