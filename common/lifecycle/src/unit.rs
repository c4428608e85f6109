//! A unit: one [`Service`] driven through the lifecycle state machine.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, Phase, UnitError};
use crate::metrics;
use crate::notify::{self, Observer, Subscription, Transition};
use crate::service::{FnService, Service};
use crate::state::State;

struct Supervisor {
    manager: String,
    observer: Arc<dyn Observer>,
}

struct Inner {
    state: State,
    failure: Option<UnitError>,
    // Present until `start` hands it to the supervising task.
    service: Option<Box<dyn Service>>,
    supervisor: Option<Supervisor>,
}

/// One independently lifecycled component.
///
/// A unit is driven through its states at most once. Apart from the initial
/// `New -> Starting` taken by [`start`](Unit::start), its state is written only by its
/// supervising task, which runs `start`, `run` and `stop` in order; everyone else reads it
/// through [`state`](Unit::state) or follows it through [`subscribe`](Unit::subscribe).
pub struct Unit {
    name: Arc<str>,
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Transition>,
}

impl Unit {
    pub fn new(name: impl Into<String>, service: impl Service) -> Arc<Self> {
        let name: String = name.into();
        Arc::new(Self {
            name: Arc::from(name),
            inner: Mutex::new(Inner {
                state: State::New,
                failure: None,
                service: Some(Box::new(service)),
                supervisor: None,
            }),
            tx: notify::channel(1),
        })
    }

    /// Unit built from three closures instead of a [`Service`] type. `stop` receives the
    /// formatted `run` error, if any.
    pub fn from_fns<S, SF, R, RF, T, TF>(
        name: impl Into<String>,
        start: S,
        run: R,
        stop: T,
    ) -> Arc<Self>
    where
        S: FnOnce(CancellationToken) -> SF + Send + 'static,
        SF: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce(CancellationToken) -> RF + Send + 'static,
        RF: Future<Output = anyhow::Result<()>> + Send + 'static,
        T: FnOnce(Option<String>) -> TF + Send + 'static,
        TF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, FnService::new(start, run, stop))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// The error that put this unit in [`State::Failed`], if it is there.
    pub fn failure(&self) -> Option<UnitError> {
        self.lock().failure.clone()
    }

    /// Current state plus every transition that happens after it, taken atomically.
    pub fn subscribe(&self) -> (State, Subscription) {
        let inner = self.lock();
        (inner.state, Subscription::new(self.tx.subscribe()))
    }

    /// Resolves with the terminal state once the unit reaches it.
    pub async fn await_terminal(&self) -> State {
        let (mut state, mut sub) = self.subscribe();
        while !state.is_terminal() {
            match sub.recv().await {
                Some(t) => state = t.to,
                None => break,
            }
        }
        state
    }

    /// Run `start` and, if it succeeds, `run` and `stop` on the unit's supervising task.
    ///
    /// Returns once the unit is `Running`, or with the `start` error once it is `Failed`.
    /// Calling it on a unit that already left `New` fails without side effects. All three
    /// operations execute on the supervising task, so dropping the returned future does
    /// not abandon the unit: it keeps going and ends in a terminal state.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), LifecycleError> {
        let service = {
            let mut inner = self.lock();
            let Some(service) = inner.service.take() else {
                return Err(self.already_started(inner.state));
            };
            if inner.state != State::New {
                inner.service = Some(service);
                return Err(self.already_started(inner.state));
            }
            self.transition_locked(&mut inner, State::Starting, None)?;
            service
        };

        let (started_tx, started_rx) = oneshot::channel();
        let unit = Arc::clone(self);
        tokio::spawn(async move { unit.supervise(service, cancel, started_tx).await });

        match started_rx.await {
            Ok(started) => started,
            Err(_) => Err(LifecycleError::StartFailed {
                unit: self.name.to_string(),
                error: UnitError::new(
                    Phase::Start,
                    anyhow!("supervising task ended before start returned"),
                ),
            }),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut service: Box<dyn Service>,
        cancel: CancellationToken,
        started: oneshot::Sender<Result<(), LifecycleError>>,
    ) {
        if let Err(e) = guarded(Phase::Start, service.start(&cancel)).await {
            let error = UnitError::new(Phase::Start, e);
            let result = self
                .transition(State::Failed, Some(error.clone()))
                .and(Err(LifecycleError::StartFailed {
                    unit: self.name.to_string(),
                    error,
                }));
            // The caller may have stopped waiting.
            drop(started.send(result));
            return;
        }

        if let Err(e) = self.transition(State::Running, None) {
            drop(started.send(Err(e)));
            return;
        }
        drop(started.send(Ok(())));

        let reason = guarded(Phase::Run, service.run(cancel.clone()))
            .await
            .err()
            .map(Arc::new);
        let run_error = reason.clone().map(|error| UnitError {
            phase: Phase::Run,
            error,
        });

        if let Err(e) = self.transition(State::Stopping, run_error.clone()) {
            error!(unit = %self.name, error = %e, "Lifecycle: supervision aborted");
            return;
        }

        let stopped = guarded(Phase::Stop, service.stop(reason.as_deref())).await;
        drop(service);

        let (state, error) = match (stopped, run_error) {
            (Err(e), _) => (State::Failed, Some(UnitError::new(Phase::Stop, e))),
            (Ok(()), Some(run_error)) => (State::Failed, Some(run_error)),
            (Ok(()), None) => (State::Terminated, None),
        };

        if let Err(e) = self.transition(state, error) {
            error!(unit = %self.name, error = %e, "Lifecycle: supervision aborted");
        }
    }

    /// Register the manager observing this unit. Only allowed once, before `start`.
    pub(crate) fn attach(
        &self,
        manager: &str,
        observer: Arc<dyn Observer>,
    ) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        if let Some(existing) = &inner.supervisor {
            return Err(LifecycleError::AlreadySupervised {
                unit: self.name.to_string(),
                manager: existing.manager.clone(),
            });
        }
        if inner.state != State::New {
            return Err(self.already_started(inner.state));
        }
        inner.supervisor = Some(Supervisor {
            manager: manager.to_string(),
            observer,
        });
        Ok(())
    }

    /// Undo [`attach`](Unit::attach) when the manager being built is discarded.
    pub(crate) fn detach(&self) {
        self.lock().supervisor = None;
    }

    fn transition(&self, to: State, error: Option<UnitError>) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, to, error)
    }

    fn transition_locked(
        &self,
        inner: &mut Inner,
        to: State,
        error: Option<UnitError>,
    ) -> Result<(), LifecycleError> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            error!(unit = %self.name, %from, %to, "Lifecycle: invalid transition rejected");
            return Err(LifecycleError::InvalidTransition {
                unit: self.name.to_string(),
                from,
                to,
            });
        }

        inner.state = to;
        if to == State::Failed {
            inner.failure = error.clone();
        }

        match &error {
            Some(e) => warn!(unit = %self.name, %from, %to, error = %e, "Lifecycle: unit transition"),
            None if to == State::Starting || to == State::Stopping => {
                debug!(unit = %self.name, %from, %to, "Lifecycle: unit transition")
            }
            None => info!(unit = %self.name, %from, %to, "Lifecycle: unit transition"),
        }
        metrics::emit_unit_transition(&self.name, to);

        let transition = Transition {
            unit: self.name.clone(),
            from,
            to,
            error,
        };
        if let Some(supervisor) = &inner.supervisor {
            supervisor.observer.on_transition(&transition);
        }
        // No receivers is fine: nobody is watching this unit.
        drop(self.tx.send(transition));
        Ok(())
    }

    fn already_started(&self, state: State) -> LifecycleError {
        error!(unit = %self.name, %state, "Lifecycle: start called on a unit that already started");
        LifecycleError::AlreadyStarted {
            unit: self.name.to_string(),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await one operation, turning a panic into an error of that phase.
async fn guarded<F>(phase: Phase, op: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(op).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("{phase} panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
