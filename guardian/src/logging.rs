use std::io;

use anyhow::Context;
use opentelemetry_sdk::trace::Tracer;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{LogConfig, LogOut};

/// Install the global subscriber: JSON lines (or pretty output) to the configured stream,
/// plus an OpenTelemetry layer when a tracer is given.
pub fn init(config: &LogConfig, tracer: Option<Tracer>) -> anyhow::Result<()> {
    let level: LevelFilter = config
        .level
        .parse()
        .with_context(|| format!("logger: `{}` is not a valid level", config.level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context("logger: invalid RUST_LOG")?;

    let writer = match config.out {
        LogOut::Stdout => BoxMakeWriter::new(io::stdout),
        LogOut::Stderr => BoxMakeWriter::new(io::stderr),
    };

    let log_layer = {
        let base_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_level(true);

        if config.pretty {
            base_layer.pretty().with_ansi(true).with_filter(filter).boxed()
        } else {
            base_layer.json().with_filter(filter).boxed()
        }
    };

    let otel_layer = tracer.map(|tracer| {
        OpenTelemetryLayer::new(tracer).with_filter(LevelFilter::from_level(tracing::Level::INFO))
    });

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .try_init()
        .context("logger: subscriber already installed")
}
