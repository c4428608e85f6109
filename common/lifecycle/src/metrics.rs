use crate::error::Phase;
use crate::state::State;

pub(crate) const METRIC_UNIT_TRANSITIONS: &str = "lifecycle_unit_transitions_total";
pub(crate) const METRIC_UNIT_FAILURES: &str = "lifecycle_unit_failures_total";
pub(crate) const METRIC_CASCADE_SHUTDOWN: &str = "lifecycle_cascade_shutdown_total";
pub(crate) const METRIC_UNITS_RUNNING: &str = "lifecycle_units_running";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "lifecycle_shutdown_completed_total";

pub(crate) fn emit_unit_transition(unit: &str, to: State) {
    metrics::counter!(
        METRIC_UNIT_TRANSITIONS,
        "unit" => unit.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub(crate) fn emit_unit_failure(manager: &str, unit: &str, phase: Phase) {
    metrics::counter!(
        METRIC_UNIT_FAILURES,
        "manager" => manager.to_string(),
        "unit" => unit.to_string(),
        "phase" => phase.as_str()
    )
    .increment(1);
}

pub(crate) fn emit_cascade_shutdown(manager: &str, trigger_unit: &str) {
    metrics::counter!(
        METRIC_CASCADE_SHUTDOWN,
        "manager" => manager.to_string(),
        "trigger_unit" => trigger_unit.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_units_running(manager: &str, running: usize) {
    metrics::gauge!(METRIC_UNITS_RUNNING, "manager" => manager.to_string()).set(running as f64);
}

pub(crate) fn emit_shutdown_completed(manager: &str, clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "manager" => manager.to_string(),
        "clean" => clean.to_string()
    )
    .increment(1);
}
