//! Health source abstraction.
//!
//! The engine never inspects sessions directly. A [`HealthSource`]
//! enumerates a project's sessions, reports raw [`SessionFacts`] for each
//! one, and carries out the side effects of accepted control actions.
//! How activity is observed (file modification times, token deltas, a
//! richer process signal) is entirely up to the implementation.

pub mod jsonl;

use std::future::Future;
use std::pin::Pin;

use crate::models::health::SessionFacts;
use crate::Result;

/// Side effect requested from a source after a control action is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCommand {
    /// Suspend the session.
    Pause,
    /// Lift a pause.
    Resume,
    /// Stop the session; `force` skips any graceful shutdown negotiation.
    Terminate {
        /// Skip graceful negotiation.
        force: bool,
    },
    /// Terminate whatever is left and start the session afresh.
    Restart,
    /// Auto-recovery nudge for a stalled or failing session.
    Nudge,
}

/// Provider of raw per-session activity facts.
///
/// Implementations must be cheap to share (`Arc<dyn HealthSource>`) and
/// safe to call concurrently for different sessions.
pub trait HealthSource: Send + Sync {
    /// Enumerate the session ids currently belonging to a project.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::DetectionFailure`](crate::AppError::DetectionFailure)
    /// if the project cannot be inspected at all. The poller treats this
    /// as a whole-tick failure.
    fn list_sessions(
        &self,
        project_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;

    /// Fetch the current facts for one session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::DetectionFailure`](crate::AppError::DetectionFailure)
    /// if this session's facts are unavailable. Only that session degrades.
    fn fetch_facts(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionFacts>> + Send + '_>>;

    /// Carry out the side effect of an accepted control action.
    ///
    /// The default records nothing and succeeds: the engine's own intent
    /// ledger is then the only effect of the action.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the session could not be
    /// reached; the controller then rolls back the recorded intent.
    fn apply_control(
        &self,
        _project_id: &str,
        _session_id: &str,
        _command: SourceCommand,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
