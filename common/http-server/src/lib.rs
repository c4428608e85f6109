//! HTTP server building blocks for guardian services
//!
//! This crate provides:
//!
//! - **Server unit**: [`HttpServer`], a [`lifecycle::Service`] that binds its listener in
//!   `start`, serves an axum [`Router`](axum::Router) in `run` and drains in-flight requests
//!   in `stop`
//! - **Shutdown**: signal handling that turns SIGTERM/SIGINT into cancellation
//!
//! # Examples
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use http_server::{HttpServer, ServerConfig};
//! use lifecycle::{Manager, Unit};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let router = Router::new().route("/", get(|| async { "ok" }));
//! let server = HttpServer::new("api", ServerConfig::new("127.0.0.1:8080"), router)?;
//!
//! let manager = Manager::new("example", [Unit::new("api", server)])?;
//! let shutdown = CancellationToken::new();
//! http_server::cancel_on_shutdown_signal(shutdown.clone())?;
//!
//! manager.start_async(&shutdown).await?;
//! manager.await_stopped(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod server;
pub mod shutdown;

pub use server::{HttpServer, LocalAddr, ServerConfig, ServerError};
pub use shutdown::cancel_on_shutdown_signal;
