//! Reusable finite-state-machine runtime for model templates.
//!
//! A template supplies a [`TransitionTable`]; the per-binding
//! [`Machine`] holds the current state and its history and is the only
//! part that is persisted. Tables are rebuilt from the template kind on
//! every load, so changing a template's table never requires a data
//! migration.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// States a model can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Freshly bound.
    Init,
    /// Installer booted, waiting for it to start.
    Preinstall,
    /// Installer finished, post-install scripts running.
    Postinstall,
    /// Installation complete.
    OsComplete,
    /// A timeout was reported.
    TimeoutError,
    /// An error was reported.
    ErrorCatch,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Preinstall => "preinstall",
            Self::Postinstall => "postinstall",
            Self::OsComplete => "os_complete",
            Self::TimeoutError => "timeout_error",
            Self::ErrorCatch => "error_catch",
        };
        f.write_str(name)
    }
}

/// Events that drive a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The booted agent checked in.
    Checkin,
    /// The node asked for a boot artifact.
    BootRequest,
    /// Something timed out.
    Timeout,
    /// Something failed.
    Error,
    /// Operator reset back to `init`.
    Reset,
    /// Installer reported that it started.
    InstallStart,
    /// Installer fetched its answer file.
    InstallFile,
    /// Installer finished laying down the OS.
    InstallEnd,
    /// Post-install finished successfully.
    InstallComplete,
    /// Post-install reported a failure.
    InstallFail,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Checkin => "checkin",
            Self::BootRequest => "boot_request",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Reset => "reset",
            Self::InstallStart => "install_start",
            Self::InstallFile => "install_file",
            Self::InstallEnd => "install_end",
            Self::InstallComplete => "install_complete",
            Self::InstallFail => "install_fail",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
struct Row {
    on: HashMap<Action, State>,
    fallback: Option<State>,
}

/// `state -> {action -> next, else -> fallback}`.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    rows: HashMap<State, Row>,
    terminal: HashSet<State>,
}

impl TransitionTable {
    /// Start building a table.
    #[must_use]
    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Next state for `action` in `state`, falling back to the row's
    /// `else` entry. `None` means the action is not handled at all.
    #[must_use]
    pub fn next(&self, state: State, action: Action) -> Option<State> {
        let row = self.rows.get(&state)?;
        row.on.get(&action).copied().or(row.fallback)
    }

    /// Whether `state` is one of the template's completion states.
    #[must_use]
    pub fn is_terminal(&self, state: State) -> bool {
        self.terminal.contains(&state)
    }

    /// Whether the table defines a row for `state`.
    #[must_use]
    pub fn has_state(&self, state: State) -> bool {
        self.rows.contains_key(&state)
    }
}

/// Builder that also wires the shared error states into every row.
#[derive(Debug, Default)]
pub struct TableBuilder {
    rows: HashMap<State, Row>,
    terminal: HashSet<State>,
}

impl TableBuilder {
    /// Define a row.
    #[must_use]
    pub fn state(mut self, state: State, on: &[(Action, State)], fallback: Option<State>) -> Self {
        self.rows.insert(
            state,
            Row {
                on: on.iter().copied().collect(),
                fallback,
            },
        );
        self
    }

    /// Mark completion states.
    #[must_use]
    pub fn terminal(mut self, states: &[State]) -> Self {
        self.terminal.extend(states.iter().copied());
        self
    }

    /// Finish the table.
    ///
    /// Every template row gains `timeout -> timeout_error` and
    /// `error -> error_catch` unless it maps them itself. Both error states
    /// absorb everything except `reset`, which returns to `init`.
    #[must_use]
    pub fn build(mut self) -> TransitionTable {
        for row in self.rows.values_mut() {
            row.on.entry(Action::Timeout).or_insert(State::TimeoutError);
            row.on.entry(Action::Error).or_insert(State::ErrorCatch);
        }
        for error_state in [State::TimeoutError, State::ErrorCatch] {
            self.rows.insert(
                error_state,
                Row {
                    on: [(Action::Reset, State::Init)].into_iter().collect(),
                    fallback: Some(error_state),
                },
            );
        }
        TransitionTable {
            rows: self.rows,
            terminal: self.terminal,
        }
    }
}

/// One recorded transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the action fired.
    pub timestamp: DateTime<Utc>,
    /// Entry point that fired it (`checkin`, `boot`, `callback:postinstall`).
    pub method: String,
    /// Action fired.
    pub action: Action,
    /// State before.
    pub old_state: State,
    /// State after.
    pub new_state: State,
    /// False when the table had no entry and the machine stayed put.
    pub handled: bool,
}

/// Persisted state of one bound model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Current state.
    pub state: State,
    /// Number of actions fired so far.
    #[serde(default)]
    pub steps: u64,
    /// Transition history.
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A machine in `init`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Init,
            steps: 0,
            log: Vec::new(),
        }
    }

    /// Fire `action` and return the resulting state.
    ///
    /// An action the table does not handle leaves the state unchanged; it
    /// is logged, never an error.
    pub fn fire(&mut self, table: &TransitionTable, action: Action, method: &str) -> State {
        let old_state = self.state;
        let next = table.next(old_state, action);
        let new_state = next.unwrap_or(old_state);

        match next {
            Some(_) => debug!(%old_state, %action, %new_state, method, "FSM transition"),
            None => warn!(state = %old_state, %action, method, "FSM action not handled in state"),
        }

        self.state = new_state;
        self.steps += 1;
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            method: method.to_string(),
            action,
            old_state,
            new_state,
            handled: next.is_some(),
        });
        new_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_table() -> TransitionTable {
        TransitionTable::builder()
            .state(
                State::Init,
                &[
                    (Action::Checkin, State::Init),
                    (Action::BootRequest, State::Preinstall),
                ],
                Some(State::Init),
            )
            .state(
                State::Preinstall,
                &[(Action::InstallEnd, State::OsComplete)],
                None,
            )
            .state(State::OsComplete, &[], Some(State::OsComplete))
            .terminal(&[State::OsComplete])
            .build()
    }

    #[test]
    fn test_explicit_transition() {
        let table = simple_table();
        let mut machine = Machine::new();
        assert_eq!(machine.fire(&table, Action::BootRequest, "boot"), State::Preinstall);
        assert_eq!(machine.fire(&table, Action::InstallEnd, "callback"), State::OsComplete);
        assert!(table.is_terminal(machine.state));
        assert_eq!(machine.steps, 2);
    }

    #[test]
    fn test_else_fallback() {
        let table = simple_table();
        let mut machine = Machine::new();
        assert_eq!(machine.fire(&table, Action::InstallFile, "callback"), State::Init);
        assert!(machine.log[0].handled);
    }

    #[test]
    fn test_unhandled_action_stays_in_place() {
        let table = simple_table();
        let mut machine = Machine::new();
        machine.fire(&table, Action::BootRequest, "boot");
        assert_eq!(machine.fire(&table, Action::Checkin, "checkin"), State::Preinstall);
        let last = machine.log.last().unwrap();
        assert!(!last.handled);
        assert_eq!(last.old_state, last.new_state);
    }

    #[test]
    fn test_timeout_is_sticky_until_reset() {
        let table = simple_table();
        let mut machine = Machine::new();
        assert_eq!(machine.fire(&table, Action::Timeout, "timeout"), State::TimeoutError);
        for action in [Action::Timeout, Action::BootRequest, Action::Checkin, Action::Error] {
            assert_eq!(machine.fire(&table, action, "test"), State::TimeoutError);
        }
        assert_eq!(machine.fire(&table, Action::Reset, "reset"), State::Init);
    }

    #[test]
    fn test_error_reachable_from_every_state() {
        let table = simple_table();
        for state in [State::Init, State::Preinstall, State::OsComplete] {
            assert_eq!(table.next(state, Action::Error), Some(State::ErrorCatch));
            assert_eq!(table.next(state, Action::Timeout), Some(State::TimeoutError));
        }
    }

    #[test]
    fn test_machine_serializes_state_names() {
        let machine = Machine::new();
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["state"], "init");
    }
}
