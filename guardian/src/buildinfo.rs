//! Build information embedded at compile time.
//!
//! CI sets `GUARDIAN_BUILD_TIME` (RFC 3339), `GUARDIAN_BRANCH`, `GUARDIAN_REVISION` and
//! `GUARDIAN_DIRTY` when building release binaries; local builds leave them empty.

use std::fmt;

use anyhow::Context;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

pub const PROGRAM: &str = "guardian";

const METRIC_BUILD_INFO: &str = "guardian_build_info";

#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub program: &'static str,
    pub version: &'static str,
    /// Time at which the binary was built.
    pub build_time: Option<OffsetDateTime>,
    pub branch: &'static str,
    /// Commit the binary was built from.
    pub revision: &'static str,
    /// Whether the source tree had local modifications.
    pub dirty: bool,
    /// `os/arch`.
    pub platform: String,
}

impl BuildInfo {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_parts(
            option_env!("GUARDIAN_BUILD_TIME").unwrap_or_default(),
            option_env!("GUARDIAN_BRANCH").unwrap_or_default(),
            option_env!("GUARDIAN_REVISION").unwrap_or_default(),
            option_env!("GUARDIAN_DIRTY").unwrap_or_default(),
        )
    }

    fn from_parts(
        build_time: &str,
        branch: &'static str,
        revision: &'static str,
        dirty: &str,
    ) -> anyhow::Result<Self> {
        let build_time = match build_time {
            "" => None,
            t => Some(
                OffsetDateTime::parse(t, &Rfc3339)
                    .with_context(|| format!("buildinfo: parse build time `{t}` as RFC 3339"))?,
            ),
        };

        Ok(Self {
            program: PROGRAM,
            version: env!("CARGO_PKG_VERSION"),
            build_time,
            branch,
            revision,
            dirty: dirty == "true",
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        })
    }

    fn build_time(&self) -> String {
        self.build_time
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_default()
    }

    pub fn log(&self) {
        info!(
            program = self.program,
            version = self.version,
            build_time = %self.build_time(),
            branch = self.branch,
            revision = self.revision,
            dirty = self.dirty,
            platform = %self.platform,
            "build information"
        );
    }

    /// Constant `1` gauge labelled by build information. Emit after the recorder is
    /// installed.
    pub fn emit_gauge(&self) {
        metrics::gauge!(
            METRIC_BUILD_INFO,
            "version" => self.version,
            "build_time" => self.build_time(),
            "branch" => self.branch,
            "revision" => self.revision,
            "dirty" => self.dirty.to_string(),
            "platform" => self.platform.clone()
        )
        .set(1.0);
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program: {}", self.program)?;
        writeln!(f, "version: {}", self.version)?;
        writeln!(f, "build_time: {}", self.build_time())?;
        writeln!(f, "branch: {}", self.branch)?;
        writeln!(f, "revision: {}", self.revision)?;
        writeln!(f, "dirty: {}", self.dirty)?;
        write!(f, "platform: {}", self.platform)
    }
}
