//! State-change notifications and their fan-out.
//!
//! Every transition is published while the unit's state lock is held, so a subscriber that
//! takes a snapshot and a receiver under that same lock sees each transition exactly once
//! and in order. A unit performs at most four transitions, which bounds the number of
//! messages any channel can ever carry: sizing the channels to that bound means receivers
//! can never lag and no notification is ever dropped or coalesced.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::UnitError;
use crate::state::State;

/// Upper bound on the number of transitions a single unit performs.
pub(crate) const MAX_TRANSITIONS: usize = 4;

/// One state transition of one unit.
#[derive(Clone, Debug)]
pub struct Transition {
    pub unit: Arc<str>,
    pub from: State,
    pub to: State,
    /// Set when entering `Failed`, and on `Running -> Stopping` when `run` returned an error.
    pub error: Option<UnitError>,
}

/// Synchronous transition hook. Invoked on the unit's supervising task, in transition
/// order, before the transition is visible to broadcast subscribers. Implementations
/// must not block.
pub(crate) trait Observer: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

/// Receiver half of a subscription: every transition published after the subscription
/// was taken, in order.
pub struct Subscription {
    rx: broadcast::Receiver<Transition>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<Transition>) -> Self {
        Self { rx }
    }

    /// Next transition, or `None` once the publisher is gone and all buffered
    /// transitions were consumed.
    pub async fn recv(&mut self) -> Option<Transition> {
        loop {
            match self.rx.recv().await {
                Ok(t) => return Some(t),
                Err(broadcast::error::RecvError::Closed) => return None,
                // Unreachable with channels sized to MAX_TRANSITIONS per unit.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::error!(skipped = n, "Lifecycle: notification subscriber lagged");
                }
            }
        }
    }
}

/// Broadcast channel sized so that `units` units can never overflow it.
pub(crate) fn channel(units: usize) -> broadcast::Sender<Transition> {
    let (tx, _) = broadcast::channel((units * MAX_TRANSITIONS).max(1));
    tx
}
