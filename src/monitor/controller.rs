//! Session lifecycle control: pause, resume, terminate, restart.
//!
//! Every request is checked against the legality table in
//! [`validate_transition`] using the session's current state (an
//! outstanding intent wins over the snapshot). Accepted actions record or
//! clear an intent, forward the side effect to the health source and
//! request an immediate refresh so the next snapshot reflects them.

use tracing::{info, info_span, warn, Instrument};

use super::registry::{refresh_entry, MonitoringContext};
use crate::models::control::{SessionControlRequest, SessionControlResult};
use crate::models::session::{ControlAction, SessionState};
use crate::source::SourceCommand;
use crate::{AppError, Result};

/// What an accepted action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move the session to this state.
    Apply(SessionState),
    /// Forced terminate of an already terminated session; nothing to do.
    AlreadyTerminated,
}

/// Check one action against the legality table.
///
/// # Errors
///
/// Returns `AppError::InvalidTransition` naming the action and the state
/// it was attempted from.
pub fn validate_transition(
    from: SessionState,
    action: ControlAction,
    force: bool,
) -> Result<Transition> {
    use ControlAction::{Pause, Restart, Resume, Terminate};
    use SessionState::{Active, Error, Idle, Paused, Stalled, Terminated};

    match (from, action) {
        (Active | Idle | Stalled | Error, Pause) => Ok(Transition::Apply(Paused)),
        (Paused, Resume) => Ok(Transition::Apply(Active)),
        (Active | Idle | Stalled | Error | Paused, Terminate) => {
            Ok(Transition::Apply(Terminated))
        }
        (Terminated, Terminate) if force => Ok(Transition::AlreadyTerminated),
        (Terminated, Restart) => Ok(Transition::Apply(Active)),
        (Paused, Pause) => Err(AppError::InvalidTransition(
            "session is already paused".into(),
        )),
        (from, action) => Err(AppError::InvalidTransition(format!(
            "cannot {action} session in state {from}"
        ))),
    }
}

fn source_command(action: ControlAction, force: bool) -> SourceCommand {
    match action {
        ControlAction::Pause => SourceCommand::Pause,
        ControlAction::Resume => SourceCommand::Resume,
        ControlAction::Terminate => SourceCommand::Terminate { force },
        ControlAction::Restart => SourceCommand::Restart,
    }
}

impl MonitoringContext {
    /// Execute an operator control request.
    ///
    /// Illegal transitions come back as `success = false` results; they
    /// are never retried.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unmonitored project or a session
    /// it does not know, and whatever the health source returned if the
    /// side effect failed. The intent is rolled back in that case unless
    /// a later request for the session has already replaced it.
    pub async fn control(&self, request: &SessionControlRequest) -> Result<SessionControlResult> {
        let span = info_span!(
            "session_control",
            project_id = %request.project_id,
            session_id = %request.session_id,
            action = request.action.as_str(),
            reason = request.reason.as_deref(),
        );
        self.execute_control(request).instrument(span).await
    }

    async fn execute_control(
        &self,
        request: &SessionControlRequest,
    ) -> Result<SessionControlResult> {
        let project_id = request.project_id.as_str();
        let session_id = request.session_id.as_str();
        let force = request.is_forced();

        let entry = self.entry(project_id).ok_or_else(|| {
            AppError::NotFound(format!("project {project_id} is not monitored"))
        })?;

        // Validate and record under one lock so concurrent requests for
        // the same session see each other's intents.
        let (transition, change) = {
            let mut state = entry.lock_state();
            let current = state
                .intents
                .pinned_state(session_id)
                .or_else(|| entry.snapshot_state(session_id))
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "session {session_id} not found in project {project_id}"
                    ))
                })?;

            let transition = match validate_transition(current, request.action, force) {
                Ok(transition) => transition,
                Err(AppError::InvalidTransition(message)) => {
                    info!(from = current.as_str(), %message, "control action rejected");
                    return Ok(SessionControlResult::rejected(message));
                }
                Err(err) => return Err(err),
            };

            let change = match transition {
                Transition::Apply(_) => Some(state.intents.apply(session_id, request.action)),
                Transition::AlreadyTerminated => None,
            };
            (transition, change)
        };

        let Some(change) = change else {
            info!("forced terminate of terminated session; nothing to do");
            return Ok(SessionControlResult::accepted(
                SessionState::Terminated,
                "session already terminated",
            ));
        };
        let Transition::Apply(expected) = transition else {
            return Err(AppError::Internal("unexpected control transition".into()));
        };

        if let Err(err) = self
            .source()
            .apply_control(project_id, session_id, source_command(request.action, force))
            .await
        {
            let rolled_back = entry.lock_state().intents.rollback(session_id, change);
            warn!(%err, rolled_back, "control side effect failed");
            return Err(err);
        }

        let refreshed = refresh_entry(&entry, true, self.settings().refresh_timeout()).await;

        let new_state = match request.action {
            ControlAction::Resume | ControlAction::Restart if refreshed => {
                entry.snapshot_state(session_id).unwrap_or(expected)
            }
            _ => expected,
        };
        info!(new_state = new_state.as_str(), refreshed, "control action applied");

        let message = match request.action {
            ControlAction::Pause => "session paused",
            ControlAction::Resume => "session resumed",
            ControlAction::Terminate => "session terminated",
            ControlAction::Restart => "session restarted",
        };
        Ok(SessionControlResult::accepted(new_state, message))
    }
}
