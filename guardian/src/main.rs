use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use guardian::buildinfo::BuildInfo;
use guardian::config::{LogConfig, MigrationCommandConfig, ServerCommandConfig};
use guardian::{logging, migrate, otel, server};

/// Lifecycle-supervised server and its database tooling. Configuration is read from the
/// environment.
#[derive(Parser, Debug)]
#[command(name = "guardian", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start server.
    Server,
    /// Work with database migration.
    Migration {
        #[command(subcommand)]
        command: MigrationCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MigrationCommand {
    /// Apply all pending migrations.
    Up,
}

fn parse_cli(build_info: &BuildInfo) -> Result<Cli, clap::Error> {
    let matches = Cli::command()
        .long_version(build_info.to_string())
        .try_get_matches()?;
    Cli::from_arg_matches(&matches)
}

async fn run(cli: Cli, build_info: BuildInfo) -> anyhow::Result<()> {
    let log_config = LogConfig::init_from_env().context("invalid log configuration")?;

    match cli.command {
        Command::Server => {
            let config = ServerCommandConfig::init_from_env().context("invalid configuration")?;
            let tracer = otel::init_tracer(&config.tracing, &build_info)?;
            let tracing_enabled = tracer.is_some();
            logging::init(&log_config, tracer)?;

            let shutdown = CancellationToken::new();
            http_server::cancel_on_shutdown_signal(shutdown.clone())
                .context("main: register signal handlers")?;

            server::run(config, &build_info, tracing_enabled, shutdown).await
        }
        Command::Migration {
            command: MigrationCommand::Up,
        } => {
            let config =
                MigrationCommandConfig::init_from_env().context("invalid configuration")?;
            logging::init(&log_config, None)?;
            migrate::up(config).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let build_info = match BuildInfo::new() {
        Ok(build_info) => build_info,
        Err(e) => {
            eprintln!("error buildinfo: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let cli = match parse_cli(&build_info) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    match run(cli, build_info).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            if tracing::dispatcher::has_been_set() {
                tracing::error!(error = %message, "command failed");
            } else {
                eprintln!("command failed: {message}");
            }
            ExitCode::FAILURE
        }
    }
}
