use crate::pprof::{handle_cmdline, handle_index, handle_profile_flamegraph, handle_profile_report};
use axum::{routing::get, Router};

// Call this method when building your axum::Router in your Rust service
pub fn apply_pprof_routes(router: Router) -> Router {
    router
        .route("/debug/pprof/", get(handle_index))
        .route("/debug/pprof/cmdline", get(handle_cmdline))
        .route("/debug/pprof/profile", get(handle_profile_report))
        .route("/debug/pprof/flamegraph", get(handle_profile_flamegraph))
}
