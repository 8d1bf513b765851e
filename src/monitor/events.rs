//! Monitor events and the daemon's event logger.
//!
//! Pollers publish [`MonitorEvent`]s on a `tokio::sync::broadcast`
//! channel owned by the [`MonitoringContext`](super::registry::MonitoringContext),
//! but only for projects whose config has `enable_notifications` set.
//! Lagging or absent receivers never slow a poller down.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::session::SessionState;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notable changes observed by a poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MonitorEvent {
    /// A session's classification changed between ticks.
    StateChanged {
        /// Owning project.
        project_id: String,
        /// Session that changed.
        session_id: String,
        /// Previous state; `None` on first sighting.
        from: Option<SessionState>,
        /// New state.
        to: SessionState,
    },
    /// A whole tick failed; detection is limited.
    Degraded {
        /// Affected project.
        project_id: String,
        /// Consecutive failed ticks so far.
        failures: u32,
    },
    /// The failure ceiling was reached and the poller stopped.
    DetectionLost {
        /// Affected project.
        project_id: String,
    },
    /// A tick succeeded after one or more failures.
    Recovered {
        /// Affected project.
        project_id: String,
    },
    /// The poller nudged a session that entered `stalled` or `error`.
    AutoRecovery {
        /// Owning project.
        project_id: String,
        /// Nudged session.
        session_id: String,
        /// State that triggered the nudge.
        state: SessionState,
    },
}

/// Spawn a task that logs every event until cancelled or the channel closes.
#[must_use]
pub fn spawn_event_logger(
    mut rx: broadcast::Receiver<MonitorEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("monitor event logger shutting down");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "monitor event logger lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("monitor event channel closed");
                        break;
                    }
                },
            };

            match event {
                MonitorEvent::StateChanged {
                    ref project_id,
                    ref session_id,
                    from,
                    to,
                } => {
                    info!(
                        project_id,
                        session_id,
                        from = from.map_or("none", SessionState::as_str),
                        to = to.as_str(),
                        "session state changed"
                    );
                }
                MonitorEvent::Degraded {
                    ref project_id,
                    failures,
                } => {
                    warn!(project_id, failures, "detection limited");
                }
                MonitorEvent::DetectionLost { ref project_id } => {
                    warn!(project_id, "detection lost; restart monitoring to resume");
                }
                MonitorEvent::Recovered { ref project_id } => {
                    info!(project_id, "detection recovered");
                }
                MonitorEvent::AutoRecovery {
                    ref project_id,
                    ref session_id,
                    state,
                } => {
                    info!(project_id, session_id, state = state.as_str(), "auto-recovery nudge sent");
                }
            }
        }
    })
}
