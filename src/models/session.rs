//! Session state classification and operator control actions.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Classification of a monitored session at one poll tick.
///
/// Derived by the detector. `Paused` and `Terminated` only arise from
/// accepted control actions; the others are soft states recomputed on
/// every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Activity observed since the previous tick.
    Active,
    /// No new activity, but not yet stale.
    Idle,
    /// No activity for longer than the stale threshold.
    Stalled,
    /// Paused by an operator.
    Paused,
    /// Terminated by an operator.
    Terminated,
    /// Error count spiked or facts could not be fetched.
    Error,
}

impl SessionState {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Stalled => "stalled",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-issued control action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Suspend the session.
    Pause,
    /// Lift a pause.
    Resume,
    /// Stop the session for good.
    Terminate,
    /// Re-spawn a terminated session.
    Restart,
}

impl ControlAction {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Terminate => "terminate",
            Self::Restart => "restart",
        }
    }

    /// Parse a wire name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRequest` for anything other than the four
    /// action names.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "terminate" => Ok(Self::Terminate),
            "restart" => Ok(Self::Restart),
            other => Err(AppError::InvalidRequest(format!(
                "unknown control action '{other}'"
            ))),
        }
    }
}

impl Display for ControlAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
