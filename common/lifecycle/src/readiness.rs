//! Readiness probe backed by the manager's view of its units.

use std::fmt::Write;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::manager::Supervision;
use crate::state::State;

/// Axum-compatible readiness probe; 200 once the manager started and every unit is
/// `Running`, 503 before that and as soon as any unit leaves `Running`.
#[derive(Clone)]
pub struct ReadinessHandler {
    shared: Arc<Supervision>,
}

impl ReadinessHandler {
    pub(crate) fn new(shared: Arc<Supervision>) -> Self {
        Self { shared }
    }

    /// Reads the manager's state board; no I/O.
    pub fn check(&self) -> ReadinessStatus {
        let (ready, units) = self.shared.readiness();
        ReadinessStatus { ready, units }
    }
}

/// Result of a readiness check. Implements [`IntoResponse`] for axum, listing every unit's
/// state in the body.
#[derive(Debug)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub units: Vec<(String, State)>,
}

impl IntoResponse for ReadinessStatus {
    fn into_response(self) -> Response {
        let mut body = String::new();
        for (unit, state) in &self.units {
            // Writing to a String cannot fail.
            let _ = writeln!(body, "{unit}: {state}");
        }
        let status = if self.ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, body).into_response()
    }
}
