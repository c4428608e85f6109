//! OpenTelemetry span export.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lifecycle::Service;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buildinfo::BuildInfo;
use crate::config::{TracingClient, TracingConfig};

/// Install the global tracer provider. Returns `None` when tracing is disabled.
pub fn init_tracer(config: &TracingConfig, build_info: &BuildInfo) -> anyhow::Result<Option<Tracer>> {
    if !config.enabled {
        return Ok(None);
    }
    if !(0.0..=1.0).contains(&config.sampling_rate) {
        anyhow::bail!(
            "tracing: sampling rate {} is not between 0 and 1",
            config.sampling_rate
        );
    }

    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.sampling_rate,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", build_info.program),
            KeyValue::new("service.version", build_info.version),
        ]));

    let pipeline = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(trace_config)
        .with_batch_config(BatchConfig::default());

    let tracer = match config.client {
        TracingClient::Grpc => pipeline
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(&config.endpoint_url)
                    .with_timeout(config.timeout.0),
            )
            .install_batch(runtime::Tokio),
        TracingClient::Http => pipeline
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(&config.endpoint_url)
                    .with_timeout(config.timeout.0)
                    .with_headers(config.headers.0.clone()),
            )
            .install_batch(runtime::Tokio),
    }
    .context("tracing: install OTLP pipeline")?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    Ok(Some(tracer))
}

/// Keeps the tracer provider for as long as the other units run, and flushes it on the way
/// out so spans recorded during shutdown are exported too.
pub struct TracerProviderUnit {
    flush_timeout: Duration,
}

impl TracerProviderUnit {
    pub fn new(flush_timeout: Duration) -> Self {
        Self { flush_timeout }
    }
}

#[async_trait]
impl Service for TracerProviderUnit {
    async fn start(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("tracing provider configured");
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn stop(&mut self, _reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        // Shutting down flushes pending batches and blocks until the exporter is done.
        let shutdown = tokio::task::spawn_blocking(global::shutdown_tracer_provider);
        match tokio::time::timeout(self.flush_timeout, shutdown).await {
            Ok(joined) => {
                joined.context("tracing provider shutdown panicked")?;
                info!("tracing provider shutdown successful");
            }
            Err(_) => warn!(
                timeout = ?self.flush_timeout,
                "tracing provider shutdown did not finish in time"
            ),
        }
        Ok(())
    }
}
