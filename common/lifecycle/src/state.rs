//! Unit lifecycle states and the transition table.

use std::fmt;

/// State of a single unit.
///
/// ```text
/// New -> Starting -> Running -> Stopping -> Terminated
///           |           |           |
///           +-----------+-----------+-----> Failed
/// ```
///
/// `New` is the only initial state, `Terminated` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Terminated | State::Failed)
    }

    /// True once the unit got past `start`, including units that already stopped cleanly.
    pub fn has_been_running(self) -> bool {
        matches!(self, State::Running | State::Stopping | State::Terminated)
    }

    /// Whether `self -> next` is allowed. Transitions only move forward; terminal
    /// states have no successors.
    pub fn can_transition_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::New, State::Starting)
                | (State::Starting, State::Running)
                | (State::Running, State::Stopping)
                | (State::Stopping, State::Terminated)
                | (State::Starting, State::Failed)
                | (State::Running, State::Failed)
                | (State::Stopping, State::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Terminated => "terminated",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
