//! `guardian migration`: schema migrations embedded in the binary.

use anyhow::Context;
use common_database::run_migrations;
use sqlx::migrate::Migrator;
use tracing::info;

use crate::config::MigrationCommandConfig;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply every pending migration.
pub async fn up(config: MigrationCommandConfig) -> anyhow::Result<()> {
    let report = run_migrations(
        &config.postgres.pool_config(),
        &config.migration_config(),
        &MIGRATOR,
    )
    .await
    .context("migration: up")?;

    match report.version {
        Some(version) if report.applied == 0 => info!(version, "schema already up to date"),
        Some(version) => info!(version, applied = report.applied, "schema migrated"),
        None => info!("no migrations to apply"),
    }
    Ok(())
}
