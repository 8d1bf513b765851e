//! Process-wide table of project monitors.
//!
//! [`MonitoringContext`] is constructed once by the hosting process and
//! passed to whoever needs it (HTTP handlers, the in-process client).
//! The table lock is only held to look up, insert or remove entries;
//! every [`MonitorEntry`] carries its own lock for config, intents and
//! status, plus a `watch` cell holding the latest snapshot. Pollers
//! replace that cell wholesale, so readers always see one tick's data.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::events::{MonitorEvent, EVENT_CHANNEL_CAPACITY};
use super::intents::IntentLedger;
use super::poller::ProjectPoller;
use crate::config::{DetectionSettings, MonitoringConfig, MonitoringConfigPatch};
use crate::models::monitoring::{MonitorStatus, MonitoringData, MonitoringUpdate};
use crate::models::session::SessionState;
use crate::source::HealthSource;
use crate::{AppError, Result};

/// Snapshot cell contents: `None` until the first tick completes.
pub type SnapshotCell = Option<Arc<MonitoringData>>;

/// Mutable per-project state guarded by the entry lock.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) status: MonitorStatus,
    pub(crate) intents: IntentLedger,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Set once the entry leaves the table; no poller may attach afterwards.
    removed: bool,
}

/// One monitored project.
#[derive(Debug)]
pub struct MonitorEntry {
    project_id: String,
    created_at: DateTime<Utc>,
    state: Mutex<EntryState>,
    snapshot: watch::Sender<SnapshotCell>,
    config: watch::Sender<MonitoringConfig>,
    refresh: Notify,
    started_ticks: AtomicU64,
    completed_ticks: watch::Sender<u64>,
}

impl MonitorEntry {
    fn new(project_id: &str, config: MonitoringConfig) -> Self {
        Self {
            project_id: project_id.to_owned(),
            created_at: Utc::now(),
            state: Mutex::new(EntryState {
                status: MonitorStatus::Running,
                intents: IntentLedger::default(),
                cancel: CancellationToken::new(),
                task: None,
                removed: false,
            }),
            snapshot: watch::Sender::new(None),
            config: watch::Sender::new(config),
            refresh: Notify::new(),
            started_ticks: AtomicU64::new(0),
            completed_ticks: watch::Sender::new(0),
        }
    }

    /// Project this entry monitors.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// When the entry was created; stands in for `last_updated` until a tick succeeds.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current monitor status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.lock_state().status
    }

    /// Config currently in effect.
    #[must_use]
    pub fn config(&self) -> MonitoringConfig {
        self.config.borrow().clone()
    }

    /// Merge `patch` into the config and publish the result.
    ///
    /// Runs under the entry lock so concurrent merges never read the same
    /// base config.
    fn merge_config(&self, patch: &MonitoringConfigPatch) -> Result<MonitoringConfig> {
        let _state = self.lock_state();
        let merged = self.config.borrow().merge(patch)?;
        self.config.send_replace(merged.clone());
        Ok(merged)
    }

    pub(crate) fn config_receiver(&self) -> watch::Receiver<MonitoringConfig> {
        self.config.subscribe()
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SnapshotCell {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn publish(&self, data: MonitoringData) {
        self.snapshot.send_replace(Some(Arc::new(data)));
    }

    /// State the latest snapshot reports for a session.
    #[must_use]
    pub fn snapshot_state(&self, session_id: &str) -> Option<SessionState> {
        self.snapshot
            .borrow()
            .as_ref()
            .and_then(|data| data.session(session_id).map(|update| update.state))
    }

    pub(crate) fn refresh_signal(&self) -> &Notify {
        &self.refresh
    }

    /// Mark the start of a tick and return its sequence number.
    pub(crate) fn begin_tick(&self) -> u64 {
        self.started_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mark a tick as complete so waiters can observe it.
    pub(crate) fn finish_tick(&self, seq: u64) {
        self.completed_ticks.send_replace(seq);
    }

    /// Ask the poller for an immediate tick.
    ///
    /// Returns the sequence number of the first tick guaranteed to start
    /// after this call. Requests arriving while a tick runs coalesce into
    /// a single follow-up tick.
    pub fn request_refresh(&self) -> u64 {
        let target = self.started_ticks.load(Ordering::SeqCst) + 1;
        self.refresh.notify_one();
        target
    }

    /// Wait until tick `target` (or a later one) completes.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_tick(&self, target: u64, timeout: Duration) -> bool {
        let mut rx = self.completed_ticks.subscribe();
        let wait = async move {
            loop {
                let done = *rx.borrow_and_update() >= target;
                if done {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub(crate) fn mark_lost(&self) {
        let mut state = self.lock_state();
        state.status = MonitorStatus::DetectionLost;
        state.task = None;
    }

    /// Retire the entry: cancel the poller and wait for it to exit.
    async fn cancel_poller(&self) {
        let task = {
            let mut state = self.lock_state();
            state.removed = true;
            state.cancel.cancel();
            state.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Explicit monitoring context owning every project monitor.
pub struct MonitoringContext {
    source: Arc<dyn HealthSource>,
    defaults: MonitoringConfig,
    settings: DetectionSettings,
    events: broadcast::Sender<MonitorEvent>,
    table: RwLock<HashMap<String, Arc<MonitorEntry>>>,
}

impl MonitoringContext {
    /// Build a context with no active monitors.
    ///
    /// `defaults` seeds the config of every newly started monitor.
    #[must_use]
    pub fn new(
        source: Arc<dyn HealthSource>,
        defaults: MonitoringConfig,
        settings: DetectionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            defaults,
            settings,
            events,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Engine-wide detection settings.
    #[must_use]
    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub(crate) fn source(&self) -> &Arc<dyn HealthSource> {
        &self.source
    }

    /// Subscribe to monitor events from every project.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Look up a project's entry.
    #[must_use]
    pub fn entry(&self, project_id: &str) -> Option<Arc<MonitorEntry>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .cloned()
    }

    /// Start monitoring a project, or merge `patch` into a running monitor.
    ///
    /// A new monitor waits for its first snapshot, bounded by the startup
    /// timeout. Calling this again never spawns a second poller; it only
    /// merges config. A monitor in `detectionLost` is respawned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig` if the merged config is invalid
    /// (nothing is changed in that case) and `AppError::InvalidRequest`
    /// for an empty project id.
    pub async fn start_monitoring(
        &self,
        project_id: &str,
        patch: Option<MonitoringConfigPatch>,
    ) -> Result<SnapshotCell> {
        if project_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("project id must not be empty".into()));
        }
        let patch = patch.unwrap_or_default();
        let fresh_config = self.defaults.merge(&patch)?;

        let (entry, created) = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            match table.get(project_id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let entry = Arc::new(MonitorEntry::new(project_id, fresh_config));
                    table.insert(project_id.to_owned(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if !created {
            entry.merge_config(&patch)?;
            if entry.status() == MonitorStatus::Running {
                debug!(project_id, "monitor already running; config merged");
                return Ok(entry.snapshot());
            }
            info!(project_id, "restarting monitor after detection loss");
        }

        let Some(target) = self.spawn_poller(&entry) else {
            return Ok(entry.snapshot());
        };
        if !entry
            .wait_for_tick(target, self.settings.startup_timeout())
            .await
        {
            debug!(project_id, "first snapshot not ready within startup timeout");
        }
        Ok(entry.snapshot())
    }

    /// Spawn a poller unless one is already attached to `entry` or the
    /// entry has been stopped.
    ///
    /// Returns the sequence number of the poller's first tick.
    fn spawn_poller(&self, entry: &Arc<MonitorEntry>) -> Option<u64> {
        let mut state = entry.lock_state();
        if state.removed {
            debug!(project_id = %entry.project_id, "entry stopped before its poller spawned");
            return None;
        }
        if state.task.is_some() {
            return None;
        }
        let target = entry.started_ticks.load(Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let poller = ProjectPoller::new(
            Arc::clone(entry),
            Arc::clone(&self.source),
            self.settings.clone(),
            self.events.clone(),
            cancel.clone(),
        );
        let span = info_span!("project_poller", project_id = %entry.project_id);
        let task = tokio::spawn(poller.run().instrument(span));

        state.status = MonitorStatus::Running;
        state.cancel = cancel;
        state.task = Some(task);
        info!(project_id = %entry.project_id, "monitoring started");
        Some(target)
    }

    /// Stop monitoring a project and discard its entry.
    ///
    /// Returns `false` when the project was not monitored; that is not an error.
    pub async fn stop_monitoring(&self, project_id: &str) -> bool {
        let removed = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project_id);
        let Some(entry) = removed else {
            debug!(project_id, "stop requested for unmonitored project");
            return false;
        };
        entry.cancel_poller().await;
        info!(project_id, "monitoring stopped");
        true
    }

    /// Validate and merge a partial config into a monitor.
    ///
    /// Takes effect on the next tick; a smaller poll interval also
    /// reschedules the pending tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unmonitored projects and
    /// `AppError::InvalidConfig` for invalid values.
    pub fn update_config(
        &self,
        project_id: &str,
        patch: &MonitoringConfigPatch,
    ) -> Result<MonitoringConfig> {
        let entry = self.entry(project_id).ok_or_else(|| {
            AppError::NotFound(format!("project {project_id} is not monitored"))
        })?;
        let merged = entry.merge_config(patch)?;
        info!(
            project_id,
            poll_interval = merged.poll_interval,
            max_sessions = merged.max_sessions,
            "monitoring config updated"
        );
        Ok(merged)
    }

    /// Latest snapshot for a project.
    #[must_use]
    pub fn snapshot(&self, project_id: &str) -> SnapshotCell {
        self.entry(project_id).and_then(|entry| entry.snapshot())
    }

    /// Latest update for one session.
    #[must_use]
    pub fn session_update(&self, project_id: &str, session_id: &str) -> Option<MonitoringUpdate> {
        self.snapshot(project_id)
            .and_then(|data| data.session(session_id).cloned())
    }

    /// Subscribe to a project's snapshot cell.
    ///
    /// Dropping the receiver only stops this consumer; the poller keeps running.
    #[must_use]
    pub fn subscribe(&self, project_id: &str) -> Option<watch::Receiver<SnapshotCell>> {
        self.entry(project_id).map(|entry| entry.snapshot.subscribe())
    }

    /// Whether a project has a live poller.
    #[must_use]
    pub fn is_monitoring(&self, project_id: &str) -> bool {
        self.entry(project_id)
            .is_some_and(|entry| entry.status() == MonitorStatus::Running)
    }

    /// Projects with a live poller.
    #[must_use]
    pub fn active_projects(&self) -> BTreeSet<String> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| entry.status() == MonitorStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Request an immediate tick, optionally waiting for it.
    ///
    /// Returns whether a fresh tick was observed (always `false` when not waiting).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unmonitored projects.
    pub async fn refresh(&self, project_id: &str, wait: bool) -> Result<bool> {
        let entry = self.entry(project_id).ok_or_else(|| {
            AppError::NotFound(format!("project {project_id} is not monitored"))
        })?;
        Ok(refresh_entry(&entry, wait, self.settings.refresh_timeout()).await)
    }

    /// Stop every monitor and wait for the pollers to exit.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<MonitorEntry>> = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.cancel_poller().await;
        }
        info!(count = entries.len(), "all monitors stopped");
    }
}

/// Trigger a tick on `entry` and optionally wait for it to complete.
pub(crate) async fn refresh_entry(entry: &MonitorEntry, wait: bool, timeout: Duration) -> bool {
    let target = entry.request_refresh();
    if !wait || entry.status() != MonitorStatus::Running {
        return false;
    }
    entry.wait_for_tick(target, timeout).await
}
