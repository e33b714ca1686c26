//! # Stage: Lifecycle State Machine
//!
//! ## Responsibility
//! Govern the valid state transitions of one evolution engine. Every public
//! lifecycle call on the engine issues its named action on entry and `Done`
//! on completion; this module decides whether those actions move the state.
//!
//! ## Guarantees
//! - Tolerant: an action that matches no table row leaves the state
//!   unchanged and is not an error
//! - Atomic: a matched transition updates state and notifies the observer
//!   with (old, new) before `transition` returns
//! - Validated: custom tables are rejected at construction time if any
//!   (state, action) key appears twice
//!
//! ## NOT Responsible For
//! - Executing lifecycle work (see: `engine`)
//! - Emitting wire events for state changes (see: `worker`)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Errors raised when building a state machine from a custom table.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The same (state, action) key maps to more than one next state.
    #[error("ambiguous transition table entry: ({0:?}, {1:?})")]
    AmbiguousEntry(State, Action),
}

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Fresh engine, nothing allocated.
    Waiting,
    /// Allocating buffers / compiling kernels.
    Preparing,
    /// Ready to run.
    Prepared,
    /// Loading a checkpoint.
    Restoring,
    /// Generation loop active (or idle after a finished segment).
    Running,
    /// Pause requested, waiting for the generation boundary.
    Pausing,
    /// Paused at a boundary, state flushed to host memory.
    Paused,
    /// Stop requested, waiting for the generation boundary.
    Stopping,
    /// Terminal. No resume possible.
    Stopped,
    /// Producing a checkpoint.
    Saving,
}

/// Actions fed to [`StateMachine::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Begin buffer allocation.
    Prepare,
    /// Begin checkpoint restoration.
    Restore,
    /// Begin (or resume) the generation loop.
    Run,
    /// Request a pause at the next boundary.
    Pause,
    /// Request an irreversible stop at the next boundary.
    Stop,
    /// Begin producing a checkpoint.
    Save,
    /// The in-flight lifecycle call completed.
    Done,
}

/// The built-in transition table: (current, action) → next.
///
/// Note that `Done` is deliberately unreachable from `Running` — a run
/// segment finishing does not change state by itself; only `pause` or
/// `stop` leave `Running`.
pub const TRANSITIONS: &[(State, Action, State)] = &[
    (State::Waiting, Action::Prepare, State::Preparing),
    (State::Preparing, Action::Done, State::Prepared),
    (State::Waiting, Action::Restore, State::Restoring),
    (State::Restoring, Action::Done, State::Prepared),
    (State::Prepared, Action::Run, State::Running),
    (State::Running, Action::Pause, State::Pausing),
    (State::Pausing, Action::Done, State::Paused),
    (State::Paused, Action::Run, State::Running),
    (State::Running, Action::Stop, State::Stopping),
    (State::Paused, Action::Stop, State::Stopping),
    (State::Stopping, Action::Done, State::Stopped),
    (State::Paused, Action::Save, State::Saving),
    (State::Saving, Action::Done, State::Paused),
];

/// Observer invoked with (old, new) after every matched transition.
pub type TransitionObserver = Box<dyn Fn(State, State) + Send + Sync>;

/// Lifecycle state machine; exactly one instance exists per engine.
pub struct StateMachine {
    table: &'static [(State, Action, State)],
    current: State,
    observer: Option<TransitionObserver>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .finish()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine over the built-in [`TRANSITIONS`] table,
    /// starting in [`State::Waiting`].
    pub fn new() -> Self {
        Self {
            table: TRANSITIONS,
            current: State::Waiting,
            observer: None,
        }
    }

    /// Create a state machine over a caller-supplied table.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AmbiguousEntry`] if any (state, action)
    /// key appears more than once. The built-in table is covered by the
    /// same check in this module's tests.
    pub fn with_table(
        table: &'static [(State, Action, State)],
    ) -> Result<Self, LifecycleError> {
        validate_table(table)?;
        Ok(Self {
            table,
            current: State::Waiting,
            observer: None,
        })
    }

    /// Register the observer notified after each matched transition.
    pub fn set_observer(&mut self, observer: TransitionObserver) {
        self.observer = Some(observer);
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.current
    }

    /// Feed an action through the table.
    ///
    /// Returns `true` and notifies the observer if a row matched; returns
    /// `false` and leaves the state untouched otherwise. Unmatched actions
    /// are tolerated by design, never rejected.
    pub fn transition(&mut self, action: Action) -> bool {
        let next = self
            .table
            .iter()
            .find(|(from, act, _)| *from == self.current && *act == action)
            .map(|(_, _, to)| *to);

        match next {
            Some(next) => {
                let old = self.current;
                self.current = next;
                debug!(?old, ?next, ?action, "lifecycle transition");
                if let Some(observer) = &self.observer {
                    observer(old, next);
                }
                true
            }
            None => {
                debug!(state = ?self.current, ?action, "unmatched lifecycle action ignored");
                false
            }
        }
    }
}

/// Reject tables with duplicate (state, action) keys.
fn validate_table(table: &[(State, Action, State)]) -> Result<(), LifecycleError> {
    let mut seen = HashSet::new();
    for (from, action, _) in table {
        if !seen.insert((*from, *action)) {
            return Err(LifecycleError::AmbiguousEntry(*from, *action));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ALL_STATES: [State; 10] = [
        State::Waiting,
        State::Preparing,
        State::Prepared,
        State::Restoring,
        State::Running,
        State::Pausing,
        State::Paused,
        State::Stopping,
        State::Stopped,
        State::Saving,
    ];

    const ALL_ACTIONS: [Action; 7] = [
        Action::Prepare,
        Action::Restore,
        Action::Run,
        Action::Pause,
        Action::Stop,
        Action::Save,
        Action::Done,
    ];

    fn machine_in(state: State) -> StateMachine {
        let mut sm = StateMachine::new();
        sm.current = state;
        sm
    }

    #[test]
    fn builtin_table_has_no_ambiguous_entries() {
        assert!(validate_table(TRANSITIONS).is_ok());
    }

    #[test]
    fn every_table_row_transitions_and_every_other_pair_is_inert() {
        for state in ALL_STATES {
            for action in ALL_ACTIONS {
                let expected = TRANSITIONS
                    .iter()
                    .find(|(from, act, _)| *from == state && *act == action)
                    .map(|(_, _, to)| *to);

                let mut sm = machine_in(state);
                let matched = sm.transition(action);

                match expected {
                    Some(next) => {
                        assert!(matched, "({state:?}, {action:?}) should match");
                        assert_eq!(sm.current(), next);
                    }
                    None => {
                        assert!(!matched, "({state:?}, {action:?}) should not match");
                        assert_eq!(sm.current(), state, "state changed on unmatched action");
                    }
                }
            }
        }
    }

    #[test]
    fn observer_sees_old_and_new() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let mut sm = StateMachine::new();
        sm.set_observer(Box::new(move |old, new| {
            assert_eq!(old, State::Waiting);
            assert_eq!(new, State::Preparing);
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(sm.transition(Action::Prepare));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Unmatched action must not notify.
        assert!(!sm.transition(Action::Save));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_happy_path() {
        let mut sm = StateMachine::new();
        for (action, expected) in [
            (Action::Prepare, State::Preparing),
            (Action::Done, State::Prepared),
            (Action::Run, State::Running),
            (Action::Pause, State::Pausing),
            (Action::Done, State::Paused),
            (Action::Save, State::Saving),
            (Action::Done, State::Paused),
            (Action::Run, State::Running),
            (Action::Stop, State::Stopping),
            (Action::Done, State::Stopped),
        ] {
            assert!(sm.transition(action));
            assert_eq!(sm.current(), expected);
        }
    }

    #[test]
    fn done_while_running_is_inert() {
        let mut sm = machine_in(State::Running);
        assert!(!sm.transition(Action::Done));
        assert_eq!(sm.current(), State::Running);
    }

    #[test]
    fn duplicate_table_entries_rejected() {
        static BAD: &[(State, Action, State)] = &[
            (State::Waiting, Action::Prepare, State::Preparing),
            (State::Waiting, Action::Prepare, State::Restoring),
        ];
        assert!(matches!(
            StateMachine::with_table(BAD),
            Err(LifecycleError::AmbiguousEntry(State::Waiting, Action::Prepare))
        ));
    }
}
