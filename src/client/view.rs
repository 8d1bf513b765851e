//! View-model for one project's monitoring screen.
//!
//! [`SessionView`] keeps the latest [`MonitoringData`], the session list
//! ordered by recent activity, and the operator's selection. Selection
//! repairs itself: when the selected session disappears from a snapshot
//! it falls back to the first session (or nothing).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::MonitorApi;
use crate::models::control::{SessionControlRequest, SessionControlResult};
use crate::models::monitoring::{by_recent_activity, MonitoringData, MonitoringUpdate};
use crate::models::session::ControlAction;
use crate::{AppError, Result};

/// Client-side state for one project.
#[derive(Debug, Clone)]
pub struct SessionView {
    project_id: String,
    data: Option<MonitoringData>,
    sessions: Vec<MonitoringUpdate>,
    selected_session_id: Option<String>,
}

impl SessionView {
    /// Empty view for a project.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            data: None,
            sessions: Vec::new(),
            selected_session_id: None,
        }
    }

    /// Project this view follows.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Latest snapshot, if any.
    #[must_use]
    pub fn data(&self) -> Option<&MonitoringData> {
        self.data.as_ref()
    }

    /// Replace the view's snapshot and repair the selection.
    pub fn apply_snapshot(&mut self, data: MonitoringData) {
        let mut sessions = data.sessions.clone();
        sessions.sort_by(by_recent_activity);

        let still_present = self
            .selected_session_id
            .as_deref()
            .is_some_and(|id| sessions.iter().any(|s| s.session_id == id));
        if !still_present {
            self.selected_session_id = sessions.first().map(|s| s.session_id.clone());
        }

        self.sessions = sessions;
        self.data = Some(data);
    }

    /// Drop the snapshot (project no longer monitored).
    pub fn clear(&mut self) {
        self.data = None;
        self.sessions.clear();
        self.selected_session_id = None;
    }

    /// Select a session by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not in the current snapshot.
    pub fn select(&mut self, session_id: &str) -> Result<()> {
        if !self.sessions.iter().any(|s| s.session_id == session_id) {
            return Err(AppError::NotFound(format!(
                "session {session_id} is not in the current snapshot"
            )));
        }
        self.selected_session_id = Some(session_id.to_owned());
        Ok(())
    }

    /// Currently selected session.
    #[must_use]
    pub fn selected(&self) -> Option<&MonitoringUpdate> {
        let id = self.selected_session_id.as_deref()?;
        self.sessions.iter().find(|s| s.session_id == id)
    }

    /// Sessions ordered most recently active first.
    #[must_use]
    pub fn sessions(&self) -> &[MonitoringUpdate] {
        &self.sessions
    }

    /// Whether the engine reported limited detection.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.data.as_ref().is_some_and(|data| data.degraded)
    }

    /// Age of the snapshot at `now`; `None` before the first snapshot.
    #[must_use]
    pub fn staleness(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.data
            .as_ref()
            .map(|data| (now - data.last_updated).to_std().unwrap_or(Duration::ZERO))
    }

    /// Fetch the latest snapshot through `api`.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from `api`.
    pub async fn refresh(&mut self, api: &dyn MonitorApi) -> Result<()> {
        match api.snapshot(&self.project_id).await? {
            Some(data) => self.apply_snapshot(data),
            None => {
                debug!(project_id = %self.project_id, "no snapshot available");
                self.clear();
            }
        }
        Ok(())
    }

    /// Run a control action on the selected session, then refresh.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRequest` when nothing is selected, and
    /// propagates errors from `api`.
    pub async fn execute_control(
        &mut self,
        api: &dyn MonitorApi,
        action: ControlAction,
        reason: Option<String>,
        force: bool,
    ) -> Result<SessionControlResult> {
        let session_id = self
            .selected_session_id
            .clone()
            .ok_or_else(|| AppError::InvalidRequest("no session selected".into()))?;

        let request = SessionControlRequest {
            project_id: self.project_id.clone(),
            session_id,
            action,
            reason,
            force: force.then_some(true),
        };
        let result = api.control(&request).await?;
        self.refresh(api).await?;
        Ok(result)
    }
}
