//! CPU profiling endpoints in the `/debug/pprof` layout, served by the profiling server.
//!
//! Use [`router::apply_pprof_routes`] to add the routes to an `axum::Router`.

pub mod pprof;
pub mod router;

pub use router::apply_pprof_routes;
