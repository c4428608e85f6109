use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct ShutdownSignals {
    term: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Fails if the signal handlers cannot be registered.
///
/// # Platform Support
///
/// Unix only. Listens for:
/// - SIGTERM (termination signal, typically sent by process managers)
/// - SIGINT (interrupt signal, typically Ctrl+C)
///
/// The handlers are registered before this returns, so a signal delivered right after the
/// call is not missed. The spawned task also ends when `token` is cancelled elsewhere.
pub fn cancel_on_shutdown_signal(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut signals = ShutdownSignals::register()?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = signals.recv() => {
                info!(signal, "shutdown signal received");
                token.cancel();
            }
        }
    }))
}
