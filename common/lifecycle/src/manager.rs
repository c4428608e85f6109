//! Lifecycle manager: concurrent start, health gating and coordinated shutdown of a fixed
//! set of units.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Failure, LifecycleError, Phase, UnitError};
use crate::metrics;
use crate::notify::{self, Observer, Subscription, Transition};
use crate::readiness::ReadinessHandler;
use crate::state::State;
use crate::unit::Unit;

/// Builder for [`Manager`]. The readiness handler can be taken before the units exist, so
/// that an HTTP unit can serve the probe of the manager supervising it.
pub struct ManagerBuilder {
    shared: Arc<Supervision>,
    units: Vec<Arc<Unit>>,
}

impl ManagerBuilder {
    pub fn with_unit(mut self, unit: Arc<Unit>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn with_units(mut self, units: impl IntoIterator<Item = Arc<Unit>>) -> Self {
        self.units.extend(units);
        self
    }

    /// Readiness probe for the manager being built; reports 503 until it is built, started
    /// and every unit is running.
    pub fn readiness_handler(&self) -> ReadinessHandler {
        ReadinessHandler::new(self.shared.clone())
    }

    /// Validate unit names and attach the manager to every unit. Units must still be `New`
    /// and must not be supervised by another manager.
    pub fn build(self) -> Result<Manager, LifecycleError> {
        let mut index = HashMap::with_capacity(self.units.len());
        for (i, unit) in self.units.iter().enumerate() {
            let name: Arc<str> = Arc::from(unit.name());
            if index.insert(name, i).is_some() {
                return Err(LifecycleError::DuplicateUnit {
                    unit: unit.name().to_string(),
                });
            }
        }

        {
            let mut board = self.shared.lock();
            board.names = self.units.iter().map(|u| Arc::from(u.name())).collect();
            board.states = vec![State::New; self.units.len()];
            board.index = index;
            board.tx = notify::channel(self.units.len());
        }

        for (i, unit) in self.units.iter().enumerate() {
            if let Err(e) = unit.attach(&self.shared.name, self.shared.clone()) {
                // Release the units registered so far, this manager will never exist.
                for attached in &self.units[..i] {
                    attached.detach();
                }
                return Err(e);
            }
            debug!(manager = %self.shared.name, unit = %unit.name(), "Lifecycle: unit registered");
        }

        Ok(Manager {
            shared: self.shared,
            units: self.units,
        })
    }
}

/// Supervises a fixed set of units: starts them concurrently, reports when all of them are
/// running, cancels all of them as soon as one fails, and reports when all of them are
/// terminal.
///
/// The manager orchestrates lifecycle calls only; the units keep owning their resources.
pub struct Manager {
    shared: Arc<Supervision>,
    units: Vec<Arc<Unit>>,
}

impl Manager {
    pub fn builder(name: &str) -> ManagerBuilder {
        ManagerBuilder {
            shared: Arc::new(Supervision::new(name)),
            units: Vec::new(),
        }
    }

    pub fn new(
        name: &str,
        units: impl IntoIterator<Item = Arc<Unit>>,
    ) -> Result<Self, LifecycleError> {
        Self::builder(name).with_units(units).build()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    /// Start every unit concurrently. Each unit's run context is a child of `parent`, so
    /// cancelling `parent` stops all of them.
    ///
    /// Returns once every `start` step returned. If any of them failed, the run context of
    /// the other units is cancelled and the error names every unit that failed to start;
    /// waiting for the others to stop is left to [`await_stopped`](Manager::await_stopped).
    pub async fn start_async(&self, parent: &CancellationToken) -> Result<(), LifecycleError> {
        let token = parent.child_token();
        if self.shared.run_token.set(token.clone()).is_err() {
            warn!(manager = %self.name(), "Lifecycle: start_async called twice");
            return Err(LifecycleError::ManagerAlreadyStarted {
                manager: self.name().to_string(),
            });
        }
        self.shared.lock().started = true;

        info!(manager = %self.name(), units = self.units.len(), "Lifecycle: starting units");

        let results = join_all(self.units.iter().map(|u| u.start(token.clone()))).await;

        let failures: Vec<Failure> = results
            .into_iter()
            .zip(&self.units)
            .filter_map(|(result, unit)| match result {
                Ok(()) => None,
                Err(LifecycleError::StartFailed { unit, error }) => Some(Failure { unit, error }),
                Err(other) => Some(Failure {
                    unit: unit.name().to_string(),
                    error: UnitError::new(Phase::Start, anyhow::Error::new(other)),
                }),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            // Covers failures that never reached the observer, e.g. a unit started by hand.
            self.shared.cascade(&failures[0].unit);
            Err(LifecycleError::StartAsync(failures))
        }
    }

    /// Request a coordinated shutdown: cancel the run context of every unit.
    pub fn stop_async(&self) {
        if let Some(token) = self.shared.run_token.get() {
            if !token.is_cancelled() {
                info!(manager = %self.name(), "Lifecycle: shutdown requested");
            }
            token.cancel();
        }
    }

    /// Wait until every unit has reached `Running`.
    ///
    /// Fails with the first recorded failure as soon as any unit is `Failed`, or with
    /// [`LifecycleError::HealthyTimeout`] naming the units still starting once `timeout`
    /// elapses. Units that finished cleanly after running count as having been healthy.
    /// Never changes any unit's state.
    pub async fn await_healthy(&self, timeout: Duration) -> Result<(), LifecycleError> {
        self.wait_for(Some(timeout), State::has_been_running, |board| {
            if let Some(first) = board.failures.first() {
                return Some(Err(first.clone().into()));
            }
            board
                .states
                .iter()
                .all(|s| s.has_been_running())
                .then_some(Ok(()))
        })
        .await
        .map_err(|pending| LifecycleError::HealthyTimeout {
            waited: timeout,
            pending,
        })?
    }

    /// Wait until every unit is terminal. Returns the first recorded failure if any unit
    /// ended `Failed`. With `timeout`, gives up with [`LifecycleError::StoppedTimeout`]
    /// naming the units that are still not terminal; the units keep stopping on their own.
    ///
    /// A manager that was never started has nothing to stop and returns `Ok` at once.
    pub async fn await_stopped(&self, timeout: Option<Duration>) -> Result<(), LifecycleError> {
        if !self.shared.lock().started {
            debug!(manager = %self.name(), "Lifecycle: await_stopped on a manager never started");
            return Ok(());
        }

        let result = self
            .wait_for(timeout, State::is_terminal, |board| {
                if !board.states.iter().all(|s| s.is_terminal()) {
                    return None;
                }
                Some(match board.failures.first() {
                    Some(first) => Err(first.clone().into()),
                    None => Ok(()),
                })
            })
            .await
            .map_err(|pending| LifecycleError::StoppedTimeout {
                waited: timeout.unwrap_or_default(),
                pending,
            })?;

        let board = self.shared.lock();
        if board.states.iter().all(|s| s.is_terminal())
            && !self.shared.shutdown_reported.swap(true, Ordering::SeqCst)
        {
            let clean = board.failures.is_empty();
            metrics::emit_shutdown_completed(self.name(), clean);
            if clean {
                info!(manager = %self.name(), clean, "Lifecycle: all units stopped");
            } else {
                warn!(
                    manager = %self.name(),
                    clean,
                    failures = board.failures.len(),
                    "Lifecycle: all units stopped with failures"
                );
            }
        }
        result
    }

    /// Snapshot of every unit's state together with a subscription to every transition
    /// after the snapshot.
    pub fn subscribe(&self) -> (Vec<(String, State)>, Subscription) {
        let board = self.shared.lock();
        (board.snapshot(), Subscription::new(board.tx.subscribe()))
    }

    pub fn states(&self) -> Vec<(String, State)> {
        self.shared.lock().snapshot()
    }

    /// The failure that triggered the cascade, if any.
    pub fn first_failure(&self) -> Option<Failure> {
        self.shared.lock().failures.first().cloned()
    }

    /// Every recorded failure, in the order the units failed.
    pub fn failures(&self) -> Vec<Failure> {
        self.shared.lock().failures.clone()
    }

    /// True while every unit is `Running`.
    pub fn is_healthy(&self) -> bool {
        self.shared.lock().all_running()
    }

    pub fn readiness_handler(&self) -> ReadinessHandler {
        ReadinessHandler::new(self.shared.clone())
    }

    /// Drive `check` with the current board after subscribing and after every transition.
    /// `Err` carries the names of the units not yet `done` when the deadline elapsed.
    async fn wait_for<F>(
        &self,
        timeout: Option<Duration>,
        done: fn(State) -> bool,
        mut check: F,
    ) -> Result<Result<(), LifecycleError>, Vec<String>>
    where
        F: FnMut(&Board) -> Option<Result<(), LifecycleError>>,
    {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut sub = {
            let board = self.shared.lock();
            if let Some(done) = check(&board) {
                return Ok(done);
            }
            Subscription::new(board.tx.subscribe())
        };

        loop {
            let next = match deadline {
                Some(at) => tokio::time::timeout_at(at, sub.recv()).await.ok(),
                None => Some(sub.recv().await),
            };

            let board = self.shared.lock();
            if let Some(done) = check(&board) {
                return Ok(done);
            }
            // Deadline elapsed, or the channel closed (the board owns the sender, so only
            // a deadline can get us here in practice).
            if !matches!(next, Some(Some(_))) {
                return Err(board.pending(done));
            }
        }
    }
}

struct Board {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, usize>,
    states: Vec<State>,
    failures: Vec<Failure>,
    started: bool,
    tx: broadcast::Sender<Transition>,
}

impl Board {
    fn snapshot(&self) -> Vec<(String, State)> {
        self.names
            .iter()
            .zip(&self.states)
            .map(|(name, state)| (name.to_string(), *state))
            .collect()
    }

    fn all_running(&self) -> bool {
        self.started && self.states.iter().all(|s| *s == State::Running)
    }

    fn pending(&self, done: impl Fn(State) -> bool) -> Vec<String> {
        self.names
            .iter()
            .zip(&self.states)
            .filter(|(_, s)| !done(**s))
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

/// State shared between a manager, the units it supervises (as their observer) and its
/// readiness handler.
pub(crate) struct Supervision {
    name: String,
    board: Mutex<Board>,
    cascaded: AtomicBool,
    shutdown_reported: AtomicBool,
    run_token: OnceLock<CancellationToken>,
}

impl Supervision {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            board: Mutex::new(Board {
                names: Vec::new(),
                index: HashMap::new(),
                states: Vec::new(),
                failures: Vec::new(),
                started: false,
                tx: notify::channel(0),
            }),
            cascaded: AtomicBool::new(false),
            shutdown_reported: AtomicBool::new(false),
            run_token: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel every unit's run context. Only the first call has an effect.
    fn cascade(&self, trigger: &str) {
        if self.cascaded.swap(true, Ordering::SeqCst) {
            debug!(manager = %self.name, unit = %trigger, "Lifecycle: shutdown already cascading");
            return;
        }
        warn!(
            manager = %self.name,
            trigger_unit = %trigger,
            "Lifecycle: unit failed, cascading shutdown to all units"
        );
        metrics::emit_cascade_shutdown(&self.name, trigger);
        if let Some(token) = self.run_token.get() {
            token.cancel();
        }
    }

    /// (ready, per-unit states) for the readiness probe.
    pub(crate) fn readiness(&self) -> (bool, Vec<(String, State)>) {
        let board = self.lock();
        (board.all_running(), board.snapshot())
    }
}

impl Observer for Supervision {
    fn on_transition(&self, transition: &Transition) {
        let mut board = self.lock();
        let Some(&i) = board.index.get(&transition.unit) else {
            return;
        };
        board.states[i] = transition.to;

        let failed = transition.to == State::Failed;
        if failed {
            if let Some(error) = &transition.error {
                metrics::emit_unit_failure(&self.name, &transition.unit, error.phase);
                board.failures.push(Failure {
                    unit: transition.unit.to_string(),
                    error: error.clone(),
                });
            }
        }

        let running = board.states.iter().filter(|s| **s == State::Running).count();
        metrics::emit_units_running(&self.name, running);

        drop(board.tx.send(transition.clone()));
        drop(board);

        if failed {
            self.cascade(&transition.unit);
        }
    }
}
