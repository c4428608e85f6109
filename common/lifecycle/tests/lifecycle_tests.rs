use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::response::IntoResponse;
use lifecycle::{LifecycleError, Manager, Phase, Service, State, Unit};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

/// Every wait in these tests goes through this guard so a regression fails instead of
/// hanging the suite.
async fn guarded<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

/// Counts the operations a service saw.
#[derive(Default)]
struct Calls {
    starts: AtomicUsize,
    runs: AtomicUsize,
    stops: AtomicUsize,
    stop_reasons: Mutex<Vec<Option<String>>>,
}

impl Calls {
    fn record_stop(&self, reason: Option<&anyhow::Error>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_reasons
            .lock()
            .unwrap()
            .push(reason.map(|e| format!("{e:#}")));
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Realistic services
//
// TcpService binds a listener in start(), accepts until cancelled in run() and
// releases the listener in stop(): the acquire/operate/release shape every
// unit has. Worker is a configurable service used to script run/stop outcomes.
// ---------------------------------------------------------------------------

struct TcpService {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    calls: Arc<Calls>,
}

impl TcpService {
    fn new(addr: SocketAddr, calls: Arc<Calls>) -> Self {
        Self {
            addr,
            listener: None,
            calls,
        }
    }
}

#[async_trait]
impl Service for TcpService {
    async fn start(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("listening at {}", self.addr))?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.calls.runs.fetch_add(1, Ordering::SeqCst);
        let listener = self.listener.as_ref().context("not started")?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    // Connection-level errors are not unit failures.
                    drop(accepted);
                }
            }
        }
    }

    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        self.calls.record_stop(reason);
        self.listener.take();
        Ok(())
    }
}

/// Scripted outcome of a Worker's run().
#[derive(Clone, Copy)]
enum RunOutcome {
    /// Run until cancelled.
    UntilCancelled,
    /// Fail on its own after the delay.
    FailAfter(Duration),
    /// Finish cleanly on its own after the delay.
    FinishAfter(Duration),
}

struct Worker {
    start_delay: Duration,
    start_error: Option<&'static str>,
    run: RunOutcome,
    stop_delay: Duration,
    stop_error: Option<&'static str>,
    calls: Arc<Calls>,
}

impl Worker {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            start_delay: Duration::ZERO,
            start_error: None,
            run: RunOutcome::UntilCancelled,
            stop_delay: Duration::ZERO,
            stop_error: None,
            calls,
        }
    }

    fn unit(self, name: &str) -> Arc<Unit> {
        Unit::new(name, self)
    }
}

#[async_trait]
impl Service for Worker {
    async fn start(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        match self.start_error {
            Some(msg) => Err(anyhow!(msg)),
            None => Ok(()),
        }
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.calls.runs.fetch_add(1, Ordering::SeqCst);
        match self.run {
            RunOutcome::UntilCancelled => {
                cancel.cancelled().await;
                Ok(())
            }
            RunOutcome::FailAfter(d) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(d) => Err(anyhow!("connection reset")),
                }
            }
            RunOutcome::FinishAfter(d) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(d) => Ok(()),
                }
            }
        }
    }

    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        self.calls.record_stop(reason);
        tokio::time::sleep(self.stop_delay).await;
        match self.stop_error {
            Some(msg) => Err(anyhow!(msg)),
            None => Ok(()),
        }
    }
}

fn forever(name: &str) -> (Arc<Unit>, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    (Worker::new(calls.clone()).unit(name), calls)
}

fn state_of(manager: &Manager, unit: &str) -> State {
    manager
        .states()
        .into_iter()
        .find(|(name, _)| name == unit)
        .map(|(_, state)| state)
        .expect("unknown unit")
}

// ---------------------------------------------------------------------------
// Section 1: Manager happy path and shutdown
// ---------------------------------------------------------------------------

/// Two long-running units: start, become healthy, stop on parent cancellation.
#[tokio::test]
async fn units_start_become_healthy_and_stop_cleanly() {
    let (a, calls_a) = forever("a");
    let (b, calls_b) = forever("b");
    let manager = Manager::new("test", [a.clone(), b.clone()]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();
    assert!(manager.is_healthy());

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();

    assert_eq!(a.state(), State::Terminated);
    assert_eq!(b.state(), State::Terminated);
    assert_eq!(calls_a.stops(), 1);
    assert_eq!(calls_b.stops(), 1);
    assert_eq!(*calls_a.stop_reasons.lock().unwrap(), vec![None]);
    assert!(manager.first_failure().is_none());
}

/// stop_async() is the manager-side way to request the same shutdown.
#[tokio::test]
async fn stop_async_stops_every_unit() {
    let (a, _) = forever("a");
    let (b, _) = forever("b");
    let manager = Manager::new("test", [a, b]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();

    manager.stop_async();
    guarded(manager.await_stopped(None)).await.unwrap();
    assert!(!parent.is_cancelled(), "only the child run context is cancelled");
}

/// A finite unit whose run() returns Ok on its own ends Terminated, and does not
/// take the other units down with it.
#[tokio::test]
async fn finite_unit_terminates_without_cascade() {
    let job_calls = Arc::new(Calls::default());
    let mut job = Worker::new(job_calls.clone());
    job.run = RunOutcome::FinishAfter(Duration::from_millis(20));
    let job = job.unit("job");
    let (server, _) = forever("server");
    let manager = Manager::new("test", [job.clone(), server.clone()]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();

    assert_eq!(guarded(job.await_terminal()).await, State::Terminated);
    assert_eq!(job_calls.stops(), 1);
    assert_eq!(*job_calls.stop_reasons.lock().unwrap(), vec![None]);
    assert_eq!(server.state(), State::Running);
    assert!(manager.first_failure().is_none());

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();
}

/// A manager without units is immediately healthy and immediately stopped.
#[tokio::test]
async fn empty_manager() {
    let manager = Manager::new("empty", []).unwrap();
    manager.start_async(&CancellationToken::new()).await.unwrap();
    manager.await_healthy(Duration::ZERO).await.unwrap();
    manager.await_stopped(Some(Duration::ZERO)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Section 2: Failures and cascading shutdown
// ---------------------------------------------------------------------------

/// A runs forever, B cannot bind its port. start_async reports B, A gets cancelled,
/// await_stopped reports B and both units end terminal. B's stop never runs.
#[tokio::test]
async fn start_failure_cancels_siblings() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let (a, calls_a) = forever("a");
    let calls_b = Arc::new(Calls::default());
    let b = Unit::new("b", TcpService::new(addr, calls_b.clone()));
    let manager = Manager::new("test", [a.clone(), b.clone()]).unwrap();
    let parent = CancellationToken::new();

    let err = manager.start_async(&parent).await.unwrap_err();
    match &err {
        LifecycleError::StartAsync(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].unit, "b");
            assert_eq!(failures[0].error.phase, Phase::Start);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(&addr.to_string()));

    let healthy = guarded(manager.await_healthy(WAIT)).await;
    assert!(matches!(healthy, Err(LifecycleError::UnitFailed { unit, .. }) if unit == "b"));

    let stopped = guarded(manager.await_stopped(Some(WAIT))).await;
    assert!(matches!(stopped, Err(LifecycleError::UnitFailed { unit, .. }) if unit == "b"));

    assert_eq!(a.state(), State::Terminated);
    assert_eq!(b.state(), State::Failed);
    assert_eq!(calls_a.stops(), 1);
    assert_eq!(calls_b.stops(), 0, "stop must not run when start failed");
    assert_eq!(calls_b.runs.load(Ordering::SeqCst), 0);
    assert_eq!(calls_a.starts.load(Ordering::SeqCst), 1);
}

/// One of three units fails in run(); the others are cancelled. A later stop
/// failure is recorded too, but the reported cause stays the original one.
#[tokio::test]
async fn run_failure_reports_original_unit() {
    let flaky_calls = Arc::new(Calls::default());
    let mut flaky = Worker::new(flaky_calls.clone());
    flaky.run = RunOutcome::FailAfter(Duration::from_millis(50));

    let sloppy_calls = Arc::new(Calls::default());
    let mut sloppy = Worker::new(sloppy_calls.clone());
    sloppy.stop_error = Some("flush failed");

    let (steady, steady_calls) = forever("steady");
    let flaky = flaky.unit("flaky");
    let sloppy = sloppy.unit("sloppy");
    let manager = Manager::new("test", [flaky.clone(), sloppy.clone(), steady.clone()]).unwrap();

    manager.start_async(&CancellationToken::new()).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();

    let err = guarded(manager.await_stopped(Some(WAIT))).await.unwrap_err();
    match err {
        LifecycleError::UnitFailed { unit, error } => {
            assert_eq!(unit, "flaky");
            assert_eq!(error.phase, Phase::Run);
            assert!(error.to_string().contains("connection reset"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(flaky.state(), State::Failed);
    assert_eq!(sloppy.state(), State::Failed);
    assert_eq!(steady.state(), State::Terminated);

    // stop ran once everywhere; the failing unit got its run error as the reason.
    assert_eq!(flaky_calls.stops(), 1);
    assert_eq!(sloppy_calls.stops(), 1);
    assert_eq!(steady_calls.stops(), 1);
    assert_eq!(
        *flaky_calls.stop_reasons.lock().unwrap(),
        vec![Some("connection reset".to_string())]
    );

    let failures = manager.failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].unit, "flaky");
    assert_eq!(failures[1].unit, "sloppy");
    assert_eq!(failures[1].error.phase, Phase::Stop);
    assert_eq!(manager.first_failure().unwrap().unit, "flaky");
}

/// A stop failure after a clean cancellation turns Terminated into Failed.
#[tokio::test]
async fn stop_failure_downgrades_clean_shutdown() {
    let calls = Arc::new(Calls::default());
    let mut worker = Worker::new(calls.clone());
    worker.stop_error = Some("graceful shutdown interrupted");
    let unit = worker.unit("server");
    let manager = Manager::new("test", [unit.clone()]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();
    parent.cancel();

    let err = guarded(manager.await_stopped(None)).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::UnitFailed { ref unit, ref error } if unit == "server" && error.phase == Phase::Stop
    ));
    assert_eq!(unit.state(), State::Failed);
    assert_eq!(*calls.stop_reasons.lock().unwrap(), vec![None]);
}

/// A unit failing while another is still starting: await_healthy reports the
/// failure instead of waiting for the slow start.
#[tokio::test]
async fn await_healthy_reports_failure_before_slow_start_finishes() {
    let slow_calls = Arc::new(Calls::default());
    let mut slow = Worker::new(slow_calls);
    slow.start_delay = Duration::from_millis(300);

    let broken_calls = Arc::new(Calls::default());
    let mut broken = Worker::new(broken_calls.clone());
    broken.start_error = Some("port in use");

    let manager = Arc::new(Manager::new("test", [slow.unit("slow"), broken.unit("broken")]).unwrap());

    let starter = manager.clone();
    let start = tokio::spawn(async move { starter.start_async(&CancellationToken::new()).await });

    let err = guarded(manager.await_healthy(WAIT)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnitFailed { ref unit, .. } if unit == "broken"));

    assert!(guarded(start).await.unwrap().is_err());
    let stopped = guarded(manager.await_stopped(Some(WAIT))).await;
    assert!(matches!(stopped, Err(LifecycleError::UnitFailed { unit, .. }) if unit == "broken"));
    assert_eq!(state_of(&manager, "slow"), State::Terminated);
    assert_eq!(broken_calls.stops(), 0);
}

// ---------------------------------------------------------------------------
// Section 3: Deadlines
// ---------------------------------------------------------------------------

/// A zero deadline against a unit whose start takes time is a deadline error,
/// never a false success.
#[tokio::test]
async fn await_healthy_zero_deadline_is_a_timeout() {
    let calls = Arc::new(Calls::default());
    let mut slow = Worker::new(calls);
    slow.start_delay = Duration::from_millis(200);
    let (fast, _) = forever("fast");
    let manager = Arc::new(Manager::new("test", [slow.unit("slow"), fast]).unwrap());
    let parent = CancellationToken::new();

    let starter = manager.clone();
    let token = parent.clone();
    let start = tokio::spawn(async move { starter.start_async(&token).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager.await_healthy(Duration::ZERO).await.unwrap_err();
    match err {
        LifecycleError::HealthyTimeout { waited, pending } => {
            assert_eq!(waited, Duration::ZERO);
            assert_eq!(pending, vec!["slow".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The deadline did not disturb the units.
    guarded(start).await.unwrap().unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();
}

/// await_stopped gives up after its deadline and leaves the unit stopping.
#[tokio::test]
async fn await_stopped_deadline_leaves_units_alone() {
    let calls = Arc::new(Calls::default());
    let mut drain = Worker::new(calls.clone());
    drain.stop_delay = Duration::from_millis(300);
    let unit = drain.unit("drain");
    let manager = Manager::new("test", [unit.clone()]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();
    parent.cancel();

    let err = manager
        .await_stopped(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::StoppedTimeout { ref pending, .. } if pending == &vec!["drain".to_string()]
    ));
    assert_eq!(unit.state(), State::Stopping);

    guarded(manager.await_stopped(None)).await.unwrap();
    assert_eq!(unit.state(), State::Terminated);
    assert_eq!(calls.stops(), 1);
}

/// A host that stops waiting for start_async does not strand the units it was starting:
/// they finish starting, see the cancellation and stop.
#[tokio::test]
async fn abandoned_start_async_still_stops() {
    let calls = Arc::new(Calls::default());
    let mut slow = Worker::new(calls.clone());
    slow.start_delay = Duration::from_millis(200);
    let manager = Manager::new("test", [slow.unit("slow")]).unwrap();
    let parent = CancellationToken::new();

    let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.start_async(&parent));
    assert!(abandoned.await.is_err());
    assert_eq!(state_of(&manager, "slow"), State::Starting);

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();
    assert_eq!(state_of(&manager, "slow"), State::Terminated);
    assert_eq!(calls.starts.load(Ordering::SeqCst), 1);
    assert_eq!(calls.stops(), 1);
}

/// Nothing was started, so there is nothing to wait for.
#[tokio::test]
async fn await_stopped_before_start_returns() {
    let (a, calls) = forever("a");
    let manager = Manager::new("test", [a]).unwrap();

    guarded(manager.await_stopped(None)).await.unwrap();
    assert_eq!(state_of(&manager, "a"), State::New);
    assert_eq!(calls.starts.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Section 4: Notifications and concurrent waiters
// ---------------------------------------------------------------------------

/// Per-unit notification order is preserved and nothing follows a terminal state.
#[tokio::test]
async fn notifications_are_ordered_per_unit() {
    let (good, _) = forever("good");
    let calls = Arc::new(Calls::default());
    let mut bad = Worker::new(calls);
    bad.start_error = Some("port in use");
    let manager = Manager::new("test", [good, bad.unit("bad")]).unwrap();

    let (snapshot, mut sub) = manager.subscribe();
    assert!(snapshot.iter().all(|(_, s)| *s == State::New));

    drop(manager.start_async(&CancellationToken::new()).await);
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap_err();

    let mut seen: Vec<(String, State, State)> = Vec::new();
    while seen.len() < 6 {
        let t = guarded(sub.recv()).await.expect("subscription closed");
        seen.push((t.unit.to_string(), t.from, t.to));
    }

    let of = |unit: &str| -> Vec<(State, State)> {
        seen.iter()
            .filter(|(u, _, _)| u == unit)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    };
    assert_eq!(
        of("bad"),
        vec![(State::New, State::Starting), (State::Starting, State::Failed)]
    );
    assert_eq!(
        of("good"),
        vec![
            (State::New, State::Starting),
            (State::Starting, State::Running),
            (State::Running, State::Stopping),
            (State::Stopping, State::Terminated),
        ]
    );
}

/// Several tasks can wait on the same manager at once; every one of them observes
/// the transitions.
#[tokio::test]
async fn concurrent_waiters_all_observe_health() {
    let calls = Arc::new(Calls::default());
    let mut slow = Worker::new(calls);
    slow.start_delay = Duration::from_millis(100);
    let manager = Arc::new(Manager::new("test", [slow.unit("slow")]).unwrap());
    let parent = CancellationToken::new();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let m = manager.clone();
            tokio::spawn(async move { m.await_healthy(WAIT).await })
        })
        .collect();

    manager.start_async(&parent).await.unwrap();
    for waiter in waiters {
        guarded(waiter).await.unwrap().unwrap();
    }

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();
}

// ---------------------------------------------------------------------------
// Section 5: Protocol violations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_async_twice_is_rejected() {
    let (a, calls) = forever("a");
    let manager = Manager::new("test", [a]).unwrap();
    let parent = CancellationToken::new();

    manager.start_async(&parent).await.unwrap();
    assert!(matches!(
        manager.start_async(&parent).await,
        Err(LifecycleError::ManagerAlreadyStarted { .. })
    ));
    assert_eq!(calls.starts.load(Ordering::SeqCst), 1);

    parent.cancel();
    guarded(manager.await_stopped(Some(WAIT))).await.unwrap();
}

#[tokio::test]
async fn duplicate_unit_names_are_rejected() {
    let (a, _) = forever("db");
    let (b, _) = forever("db");
    assert!(matches!(
        Manager::new("test", [a, b]),
        Err(LifecycleError::DuplicateUnit { unit }) if unit == "db"
    ));
}

#[tokio::test]
async fn unit_belongs_to_one_manager() {
    let (a, _) = forever("a");
    let _first = Manager::new("first", [a.clone()]).unwrap();
    assert!(matches!(
        Manager::new("second", [a]),
        Err(LifecycleError::AlreadySupervised { manager, .. }) if manager == "first"
    ));
}

/// A manager that fails to build releases the units it had already registered.
#[tokio::test]
async fn failed_build_releases_registered_units() {
    let (a, _) = forever("a");
    let (b, b_calls) = forever("b");
    let _first = Manager::new("first", [a.clone()]).unwrap();

    assert!(matches!(
        Manager::new("second", [b.clone(), a]),
        Err(LifecycleError::AlreadySupervised { unit, manager }) if unit == "a" && manager == "first"
    ));

    let third = Manager::new("third", [b]).unwrap();
    let parent = CancellationToken::new();
    third.start_async(&parent).await.unwrap();
    guarded(third.await_healthy(WAIT)).await.unwrap();
    parent.cancel();
    guarded(third.await_stopped(Some(WAIT))).await.unwrap();
    assert_eq!(b_calls.stops(), 1);
}

// ---------------------------------------------------------------------------
// Section 6: Readiness probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn readiness_follows_unit_states() {
    let (a, _) = forever("a");
    let calls = Arc::new(Calls::default());
    let mut flaky = Worker::new(calls);
    flaky.run = RunOutcome::FailAfter(Duration::from_millis(100));

    let builder = Manager::builder("test");
    let readiness = builder.readiness_handler();
    assert!(!readiness.check().ready);

    let manager = builder.with_unit(a).with_unit(flaky.unit("flaky")).build().unwrap();
    assert!(!readiness.check().ready, "not ready before start");

    manager.start_async(&CancellationToken::new()).await.unwrap();
    guarded(manager.await_healthy(WAIT)).await.unwrap();
    let status = readiness.check();
    assert!(status.ready);
    assert_eq!(status.units.len(), 2);
    assert_eq!(status.into_response().status(), axum::http::StatusCode::OK);

    guarded(manager.await_stopped(Some(WAIT))).await.unwrap_err();
    let status = readiness.check();
    assert!(!status.ready);
    assert!(status.units.contains(&("flaky".to_string(), State::Failed)));
    assert_eq!(
        status.into_response().status(),
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    );
}
