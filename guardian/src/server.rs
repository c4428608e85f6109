//! `guardian server`: every long-running part of the process as one supervised set of units.

use std::future::ready;

use anyhow::Context;
use axum::{routing::get, Router};
use common_database::PoolUnit;
use common_metrics::{setup_metrics_recorder, setup_metrics_routes};
use common_profiler::apply_pprof_routes;
use http_server::{HttpServer, ServerConfig};
use lifecycle::{LivenessHandler, Manager, Unit};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buildinfo::BuildInfo;
use crate::config::ServerCommandConfig;
use crate::otel::TracerProviderUnit;

pub const MANAGER_NAME: &str = "guardian";

/// Build the units, start them under `shutdown` and block until all of them stopped.
///
/// Cancelling `shutdown` (SIGINT/SIGTERM) stops the process cleanly; any unit failing stops
/// all the others and the failure is returned.
pub async fn run(
    config: ServerCommandConfig,
    build_info: &BuildInfo,
    tracing_enabled: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    build_info.log();

    let manager = build_manager(&config, build_info, tracing_enabled)?;

    if let Err(e) = manager.start_async(&shutdown).await {
        error!(error = %e, "start manager failed, waiting for started units to stop");
        drain(&manager, &config).await;
        return Err(e).context("main: start manager");
    }

    if let Err(e) = manager.await_healthy(config.healthy_timeout.0).await {
        error!(error = %e, "units did not become healthy, stopping");
        manager.stop_async();
        drain(&manager, &config).await;
        return Err(e).context("main: await healthy manager");
    }

    info!("all services running");

    manager
        .await_stopped(config.stopped_timeout())
        .await
        .context("main: await stopped manager")?;

    info!("all services stopped");
    Ok(())
}

fn build_manager(
    config: &ServerCommandConfig,
    build_info: &BuildInfo,
    tracing_enabled: bool,
) -> anyhow::Result<Manager> {
    let mut builder = Manager::builder(MANAGER_NAME);

    if tracing_enabled {
        builder = builder.with_unit(Unit::new(
            "tracing",
            TracerProviderUnit::new(config.tracing.timeout.0),
        ));
    }

    let pool = PoolUnit::new("primary", config.postgres.pool_config())
        .context("main: connect postgres")?;
    builder = builder.with_unit(Unit::new("postgres", pool));

    if config.metrics.enabled {
        let handle = setup_metrics_recorder().context("main: install metrics recorder")?;
        build_info.emit_gauge();

        let readiness = builder.readiness_handler();
        let liveness = LivenessHandler::new();
        let router = Router::new()
            .route("/_readiness", get(move || ready(readiness.check())))
            .route("/_liveness", get(move || ready(liveness.check())));
        let router = setup_metrics_routes(router, handle);

        let server = HttpServer::new("metrics", server_config(config, &config.metrics.addr), router)
            .context("main: new metrics server")?;
        builder = builder.with_unit(Unit::new("metrics", server));
    }

    if config.profiling.enabled {
        let router = apply_pprof_routes(Router::new());
        let server =
            HttpServer::new("profiling", server_config(config, &config.profiling.addr), router)
                .context("main: new profiling server")?;
        builder = builder.with_unit(Unit::new("profiling", server));
    }

    builder.build().context("main: new services manager")
}

fn server_config(config: &ServerCommandConfig, addr: &str) -> ServerConfig {
    ServerConfig {
        addr: addr.to_string(),
        shutdown_timeout: config.http_shutdown_timeout(),
    }
}

/// Wait for units that did start to release their resources. The original error is what
/// gets reported, so the outcome here is only logged.
async fn drain(manager: &Manager, config: &ServerCommandConfig) {
    if let Err(e) = manager.await_stopped(config.stopped_timeout()).await {
        error!(error = %e, "units did not stop cleanly");
    }
}
