//! The three operations a unit binds to the state machine.

use std::future::Future;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Acquire / operate / release contract of a unit.
///
/// The supervising routine calls `start` once. If it succeeds, `run` is called once on a
/// dedicated task, and `stop` is called exactly once after `run` returns, whatever the
/// outcome of `run`.
///
/// `run` must return promptly once `cancel` is cancelled. A `run` that ignores
/// cancellation keeps its unit (and any manager waiting on it) in `Running` forever; the
/// framework has no way to detect or interrupt it.
#[async_trait]
pub trait Service: Send + 'static {
    /// Acquire resources (bind a listener, open a pool). An error here fails the unit
    /// before anything runs and `stop` is never called.
    async fn start(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Operate until `cancel` fires or until the work ends on its own. Returning `Ok`
    /// without cancellation is a clean finish, not a failure.
    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Release what `start` acquired. `reason` is `None` after a clean `run`, or the
    /// error `run` returned.
    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()>;
}

/// [`Service`] assembled from three closures, see [`Unit::from_fns`](crate::Unit::from_fns).
pub struct FnService<S, R, T> {
    start: Option<S>,
    run: Option<R>,
    stop: Option<T>,
}

impl<S, R, T> FnService<S, R, T> {
    pub fn new(start: S, run: R, stop: T) -> Self {
        Self {
            start: Some(start),
            run: Some(run),
            stop: Some(stop),
        }
    }
}

#[async_trait]
impl<S, SF, R, RF, T, TF> Service for FnService<S, R, T>
where
    S: FnOnce(CancellationToken) -> SF + Send + 'static,
    SF: Future<Output = anyhow::Result<()>> + Send + 'static,
    R: FnOnce(CancellationToken) -> RF + Send + 'static,
    RF: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: FnOnce(Option<String>) -> TF + Send + 'static,
    TF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn start(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let start = self.start.take().ok_or_else(|| anyhow!("start already called"))?;
        start(cancel.clone()).await
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let run = self.run.take().ok_or_else(|| anyhow!("run already called"))?;
        run(cancel).await
    }

    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        let stop = self.stop.take().ok_or_else(|| anyhow!("stop already called"))?;
        stop(reason.map(|e| format!("{e:#}"))).await
    }
}
