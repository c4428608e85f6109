//! Lifecycle error types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::state::State;

/// Lifecycle phase an operation error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    Run,
    Stop,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Run => "run",
            Phase::Stop => "stop",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by one of a unit's operations. Cheap to clone so the same error can be
/// carried by notifications, the unit and the manager's failure record.
#[derive(Clone, Debug, Error)]
#[error("{phase} failed: {error:#}")]
pub struct UnitError {
    pub phase: Phase,
    pub error: Arc<anyhow::Error>,
}

impl UnitError {
    pub fn new(phase: Phase, error: anyhow::Error) -> Self {
        Self {
            phase,
            error: Arc::new(error),
        }
    }
}

/// A unit that ended in [`State::Failed`].
#[derive(Clone, Debug)]
pub struct Failure {
    pub unit: String,
    pub error: UnitError,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

/// Errors returned by [`Unit`](crate::Unit) and [`Manager`](crate::Manager).
#[derive(Clone, Debug, Error)]
pub enum LifecycleError {
    /// `start` called on a unit that already left [`State::New`].
    #[error("unit '{unit}' already started (state: {state})")]
    AlreadyStarted { unit: String, state: State },

    /// The supervising routine attempted a transition the state machine forbids.
    #[error("unit '{unit}': invalid transition {from} -> {to}")]
    InvalidTransition { unit: String, from: State, to: State },

    /// `start_async` called twice on the same manager.
    #[error("manager '{manager}' already started")]
    ManagerAlreadyStarted { manager: String },

    /// Two units registered under the same name.
    #[error("duplicate unit name '{unit}'")]
    DuplicateUnit { unit: String },

    /// The unit is already supervised by another manager.
    #[error("unit '{unit}' is already supervised by manager '{manager}'")]
    AlreadySupervised { unit: String, manager: String },

    /// A unit's `start` operation failed.
    #[error("unit '{unit}' failed to start: {error}")]
    StartFailed {
        unit: String,
        #[source]
        error: UnitError,
    },

    /// One or more units failed to start during `start_async`.
    #[error("failed to start {}: {}", plural(.0.len()), join(.0))]
    StartAsync(Vec<Failure>),

    /// A unit ended in [`State::Failed`].
    #[error("unit '{unit}' failed: {error}")]
    UnitFailed {
        unit: String,
        #[source]
        error: UnitError,
    },

    /// `await_healthy` deadline elapsed.
    #[error("units not running after {waited:?}: {}", .pending.join(", "))]
    HealthyTimeout {
        waited: Duration,
        pending: Vec<String>,
    },

    /// `await_stopped` deadline elapsed.
    #[error("units not stopped after {waited:?}: {}", .pending.join(", "))]
    StoppedTimeout {
        waited: Duration,
        pending: Vec<String>,
    },
}

impl From<Failure> for LifecycleError {
    fn from(failure: Failure) -> Self {
        LifecycleError::UnitFailed {
            unit: failure.unit,
            error: failure.error,
        }
    }
}

fn plural(n: usize) -> String {
    if n == 1 {
        "1 unit".to_string()
    } else {
        format!("{n} units")
    }
}

fn join(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
