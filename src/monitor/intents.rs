//! Per-project ledger of operator control intents.
//!
//! Accepted `pause` and `terminate` actions leave an intent behind; the
//! detector consults it before any activity-based rule, so these states
//! persist until another control action clears them.

use std::collections::{HashMap, HashSet};

use crate::models::session::{ControlAction, SessionState};

/// Ticks a terminated session stays in snapshots before it is hidden.
pub const TERMINATED_VISIBLE_TICKS: u32 = 2;

/// Kind of outstanding intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    /// Session paused until resumed.
    Pause,
    /// Session terminated until restarted.
    Terminate,
}

impl IntentKind {
    /// State the intent pins the session to.
    #[must_use]
    pub fn state(self) -> SessionState {
        match self {
            Self::Pause => SessionState::Paused,
            Self::Terminate => SessionState::Terminated,
        }
    }
}

/// One recorded intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlIntent {
    /// What the operator asked for.
    pub kind: IntentKind,
    /// Snapshots that have shown the session as terminated.
    pub published_ticks: u32,
}

/// Undo record returned by [`IntentLedger::apply`].
#[derive(Debug)]
#[must_use]
pub struct IntentChange {
    previous: Option<ControlIntent>,
    previous_change: Option<u64>,
    change: u64,
}

/// Intents keyed by session id.
///
/// Every applied action stamps the session with a fresh change number.
/// A rollback only takes effect while the session still carries the
/// number of the change being undone.
#[derive(Debug, Default)]
pub struct IntentLedger {
    intents: HashMap<String, ControlIntent>,
    changes: HashMap<String, u64>,
    next_change: u64,
}

impl IntentLedger {
    /// State pinned by an intent, if any.
    #[must_use]
    pub fn pinned_state(&self, session_id: &str) -> Option<SessionState> {
        self.intents.get(session_id).map(|intent| intent.kind.state())
    }

    /// Apply an accepted action. `resume` and `restart` clear the intent.
    pub fn apply(&mut self, session_id: &str, action: ControlAction) -> IntentChange {
        self.next_change += 1;
        let change = self.next_change;
        let previous_change = self.changes.insert(session_id.to_owned(), change);
        let kind = match action {
            ControlAction::Pause => Some(IntentKind::Pause),
            ControlAction::Terminate => Some(IntentKind::Terminate),
            ControlAction::Resume | ControlAction::Restart => None,
        };
        let previous = match kind {
            Some(kind) => self.intents.insert(
                session_id.to_owned(),
                ControlIntent {
                    kind,
                    published_ticks: 0,
                },
            ),
            None => self.intents.remove(session_id),
        };
        IntentChange {
            previous,
            previous_change,
            change,
        }
    }

    /// Undo `change` unless a later change to the session superseded it.
    ///
    /// Returns whether the ledger was modified.
    pub fn rollback(&mut self, session_id: &str, change: IntentChange) -> bool {
        if self.changes.get(session_id) != Some(&change.change) {
            return false;
        }
        match change.previous {
            Some(intent) => {
                self.intents.insert(session_id.to_owned(), intent);
            }
            None => {
                self.intents.remove(session_id);
            }
        }
        match change.previous_change {
            Some(previous) => {
                self.changes.insert(session_id.to_owned(), previous);
            }
            None => {
                self.changes.remove(session_id);
            }
        }
        true
    }

    /// Drop everything recorded for sessions the source no longer lists.
    pub fn retain_sessions(&mut self, listed: &HashSet<&str>) {
        self.intents.retain(|id, _| listed.contains(id.as_str()));
        self.changes.retain(|id, _| listed.contains(id.as_str()));
    }

    /// Intent kinds by session, for one poll tick.
    #[must_use]
    pub fn kinds(&self) -> HashMap<String, IntentKind> {
        self.intents
            .iter()
            .map(|(id, intent)| (id.clone(), intent.kind))
            .collect()
    }

    /// Terminated sessions that have been visible long enough to drop.
    #[must_use]
    pub fn hidden(&self) -> HashSet<String> {
        self.intents
            .iter()
            .filter(|(_, intent)| {
                intent.kind == IntentKind::Terminate
                    && intent.published_ticks >= TERMINATED_VISIBLE_TICKS
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Count one more snapshot showing these sessions as terminated.
    pub fn note_published<'a>(&mut self, session_ids: impl IntoIterator<Item = &'a str>) {
        for id in session_ids {
            if let Some(intent) = self.intents.get_mut(id) {
                if intent.kind == IntentKind::Terminate {
                    intent.published_ticks = intent.published_ticks.saturating_add(1);
                }
            }
        }
    }
}
