//! Control request and result exchanged with the session controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::{ControlAction, SessionState};

/// Operator request to change a session's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionControlRequest {
    /// Owning project.
    pub project_id: String,
    /// Target session.
    pub session_id: String,
    /// Requested action.
    pub action: ControlAction,
    /// Free-form operator note, recorded with the intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Skip graceful negotiation on `terminate`; makes repeated terminates idempotent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

impl SessionControlRequest {
    /// Build a request without reason or force.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        session_id: impl Into<String>,
        action: ControlAction,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            session_id: session_id.into(),
            action,
            reason: None,
            force: None,
        }
    }

    /// Whether `force` was requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.force.unwrap_or(false)
    }
}

/// Outcome of a control request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionControlResult {
    /// Whether the action was accepted.
    pub success: bool,
    /// Human-readable detail; names the violated transition on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Expected post-action state; always present when `success` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<SessionState>,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl SessionControlResult {
    /// Accepted result.
    #[must_use]
    pub fn accepted(new_state: SessionState, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            new_state: Some(new_state),
            timestamp: Utc::now(),
        }
    }

    /// Rejected result.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            new_state: None,
            timestamp: Utc::now(),
        }
    }
}
