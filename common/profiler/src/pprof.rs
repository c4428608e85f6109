use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::Query,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::{flamegraph::Options, protos::Message, ProfilerGuard, ProfilerGuardBuilder};
use serde::Deserialize;
use tokio::time::sleep;

const DEFAULT_SECONDS: u64 = 10;
const MAX_SECONDS: u64 = 300;
const DEFAULT_FREQUENCY: i32 = 200;
const DEFAULT_IMAGE_WIDTH: usize = 2500;

#[derive(Deserialize)]
pub struct ProfileQueryParams {
    // seconds to run the profiler before taking snapshot
    pub seconds: Option<u64>,
    // profiler sample frequency in Hz
    pub frequency: Option<i32>,

    // flamegraph SVG generator options
    pub image_width: Option<usize>,
}

impl ProfileQueryParams {
    fn sampling(&self) -> Result<(i32, u64), Response> {
        let seconds = self.seconds.unwrap_or(DEFAULT_SECONDS);
        let frequency = self.frequency.unwrap_or(DEFAULT_FREQUENCY);
        if seconds == 0 || seconds > MAX_SECONDS {
            return Err(bad_request(format!(
                "seconds must be between 1 and {MAX_SECONDS}"
            )));
        }
        if frequency <= 0 {
            return Err(bad_request("frequency must be positive".to_string()));
        }
        Ok((frequency, seconds))
    }
}

//
// Examples:
// curl -sSL "http://localhost:9003/debug/pprof/profile?seconds=10&frequency=200" > profile.pb.gz
//
// curl -sSL "http://localhost:9003/debug/pprof/flamegraph?seconds=10&image_width=2500" > flamegraph.svg.gz
//
// NOTE: the profiling server listens on localhost by default; tunnel to it (ssh -L or
//       "kubectl port-forward") rather than exposing it.

pub async fn handle_index() -> &'static str {
    "profiles:\n\
     /debug/pprof/profile     gzipped pprof CPU profile (?seconds=&frequency=)\n\
     /debug/pprof/flamegraph  gzipped flamegraph SVG (?seconds=&frequency=&image_width=)\n\
     /debug/pprof/cmdline     NUL-separated command line of this process\n"
}

pub async fn handle_cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

pub async fn handle_profile_report(Query(params): Query<ProfileQueryParams>) -> Response {
    let (frequency, seconds) = match params.sampling() {
        Ok(sampling) => sampling,
        Err(response) => return response,
    };
    gzip_response(generate_report(frequency, seconds).await)
}

pub async fn handle_profile_flamegraph(Query(params): Query<ProfileQueryParams>) -> Response {
    let (frequency, seconds) = match params.sampling() {
        Ok(sampling) => sampling,
        Err(response) => return response,
    };
    let image_width = params.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH);
    gzip_response(generate_flamegraph(frequency, seconds, image_width).await)
}

fn gzip_response(body: Result<Vec<u8>>) -> Response {
    match body {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "application/octet-stream")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain")],
            format!("{e:#}"),
        )
            .into_response(),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [("Content-Type", "text/plain")],
        message,
    )
        .into_response()
}

async fn sample(frequency: i32, seconds: u64) -> Result<ProfilerGuard<'static>> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to build profiler guard")?;

    sleep(Duration::from_secs(seconds)).await;
    Ok(guard)
}

async fn generate_report(frequency: i32, seconds: u64) -> Result<Vec<u8>> {
    let guard = sample(frequency, seconds).await?;

    let profile = guard
        .report()
        .build()
        .context("Failed to build profiler report")?
        .pprof()
        .context("Failed to build profiler profile")?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    profile
        .write_to_writer(&mut encoder)
        .context("Failed to write profile to writer")?;
    encoder.finish().context("Failed to finish encoding profile")
}

async fn generate_flamegraph(frequency: i32, seconds: u64, image_width: usize) -> Result<Vec<u8>> {
    let guard = sample(frequency, seconds).await?;

    let mut options = Options::default();
    options.image_width = Some(image_width);
    let mut svg = Vec::new();
    guard
        .report()
        .build()
        .context("Failed to build flamegraph report")?
        .flamegraph_with_options(&mut svg, &mut options)
        .context("Failed to populate flamegraph image buffer")?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&svg)
        .context("Failed to write flamegraph image to buffer")?;
    encoder
        .finish()
        .context("Failed to finish encoding flamegraph image")
}
