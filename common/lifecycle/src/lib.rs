//! Service lifecycle supervision: a per-unit state machine (new, starting, running,
//! stopping, terminated/failed) binding user-supplied start/run/stop operations, and a
//! manager that starts a fixed set of units concurrently, waits for them to become
//! healthy, cascades any unit's failure into a coordinated shutdown of the others and
//! waits for all of them to stop.

mod error;
mod liveness;
mod manager;
mod metrics;
mod notify;
mod readiness;
mod service;
mod state;
mod unit;

pub use error::{Failure, LifecycleError, Phase, UnitError};
pub use liveness::{LivenessHandler, LivenessStatus};
pub use manager::{Manager, ManagerBuilder};
pub use notify::{Subscription, Transition};
pub use readiness::{ReadinessHandler, ReadinessStatus};
pub use service::{FnService, Service};
pub use state::State;
pub use unit::Unit;
