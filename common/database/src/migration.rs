//! Schema migrations over a single dedicated connection.

use std::time::Duration;

use sqlx::migrate::{Migrate, Migrator};
use sqlx::{ConnectOptions, Connection, PgConnection};
use tracing::info;

use crate::config::PoolConfig;
use crate::error::DatabaseError;

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Maximum wait for the migration lock and any table lock a migration takes.
    pub lock_timeout: Duration,
    /// Timeout per statement. Zero means no timeout.
    pub statement_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(15),
            statement_timeout: Duration::ZERO,
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.lock_timeout.is_zero() {
            return Err(DatabaseError::InvalidConfig("LockTimeout cannot be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrations applied by this run.
    pub applied: usize,
    /// Latest version recorded in the database after the run.
    pub version: Option<i64>,
}

/// Apply every pending migration of `migrator`.
///
/// Pool sizing settings are ignored: migrations run on one connection whose session gets
/// `lock_timeout` and `statement_timeout` from `config`. Concurrent runs serialize on the
/// migrator's advisory lock.
pub async fn run_migrations(
    pool: &PoolConfig,
    config: &MigrationConfig,
    migrator: &Migrator,
) -> Result<MigrationReport, DatabaseError> {
    config.validate()?;
    let options = pool.connect_options()?;

    let mut conn = options.connect().await.map_err(DatabaseError::Connect)?;
    set_session_timeout(&mut conn, "lock_timeout", config.lock_timeout).await?;
    set_session_timeout(&mut conn, "statement_timeout", config.statement_timeout).await?;

    conn.ensure_migrations_table().await?;
    let before = conn.list_applied_migrations().await?.len();

    info!(known = migrator.iter().count(), applied = before, "running migrations");
    migrator.run(&mut conn).await?;

    let applied = conn.list_applied_migrations().await?;
    let report = MigrationReport {
        applied: applied.len().saturating_sub(before),
        version: applied.iter().map(|m| m.version).max(),
    };
    info!(applied = report.applied, version = ?report.version, "migrations complete");

    drop(conn.close().await);
    Ok(report)
}

async fn set_session_timeout(
    conn: &mut PgConnection,
    setting: &'static str,
    timeout: Duration,
) -> Result<(), DatabaseError> {
    // SET does not accept bind parameters.
    let statement = format!("SET {setting} = '{}ms'", timeout.as_millis());
    sqlx::query(&statement)
        .execute(&mut *conn)
        .await
        .map_err(|source| DatabaseError::Session { setting, source })?;
    Ok(())
}
