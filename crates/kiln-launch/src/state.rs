use std::fmt;

use tokio::sync::watch;

/// Lifecycle of one launch.
///
/// ```text
/// NotStarted ──> Binding ──> Serving ──> Terminated
///      │            │                        ▲
///      │            └────────────────────────┤  bind failure
///      └─────────────────────────────────────┘  entry point does not resolve
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    NotStarted,
    Binding,
    Serving,
    Terminated,
}

impl LauncherState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use LauncherState::*;
        matches!(
            (self, next),
            (NotStarted, Binding)
                | (NotStarted, Terminated)
                | (Binding, Serving)
                | (Binding, Terminated)
                | (Serving, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

impl fmt::Display for LauncherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Binding => "binding",
            Self::Serving => "serving",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Publishes state changes to any number of watchers.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<LauncherState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LauncherState::NotStarted);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LauncherState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> LauncherState {
        *self.tx.borrow()
    }

    pub(crate) fn transition(&self, next: LauncherState) -> Result<(), InvalidTransition> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.tx.send_replace(next);
        tracing::debug!(%from, to = %next, "launcher state");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("launcher cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: LauncherState,
    pub to: LauncherState,
}
