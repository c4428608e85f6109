use async_trait::async_trait;
use lifecycle::Service;
use sqlx::postgres::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::DatabaseError;

const METRIC_POOL_CONNECTIONS: &str = "db_pool_connections";
const METRIC_POOL_MAX_CONNECTIONS: &str = "db_pool_max_connections";

/// Owns a Postgres pool for the lifetime of its unit.
///
/// The pool is created lazily in [`PoolUnit::new`] so other units can be handed a clone
/// before anything connects. `start` pings the database, `run` exports pool statistics
/// until cancelled and `stop` closes the pool, waiting for checked-out connections to be
/// returned.
pub struct PoolUnit {
    db_name: String,
    config: PoolConfig,
    pool: PgPool,
}

impl PoolUnit {
    pub fn new(db_name: &str, config: PoolConfig) -> Result<Self, DatabaseError> {
        let options = config.connect_options()?;
        let pool = config.pool_options().connect_lazy_with(options);
        Ok(Self {
            db_name: db_name.to_string(),
            config,
            pool,
        })
    }

    /// Handle to the pool. Queries fail with `PoolClosed` once the unit stopped.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    fn export_stats(&self) {
        let size = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(size);
        let db_name = self.db_name.clone();

        metrics::gauge!(METRIC_POOL_CONNECTIONS, "db_name" => db_name.clone(), "state" => "idle")
            .set(f64::from(idle));
        metrics::gauge!(METRIC_POOL_CONNECTIONS, "db_name" => db_name.clone(), "state" => "acquired")
            .set(f64::from(size - idle));
        metrics::gauge!(METRIC_POOL_MAX_CONNECTIONS, "db_name" => db_name)
            .set(f64::from(self.config.max_conns));
    }
}

#[async_trait]
impl Service for PoolUnit {
    async fn start(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::Ping)?;
        info!(db_name = %self.db_name, "connected to postgres");
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config.stats_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => self.export_stats(),
            }
        }
    }

    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        if let Some(e) = reason {
            warn!(db_name = %self.db_name, error = %e, "closing postgres pool after failure");
        }
        self.pool.close().await;
        info!(db_name = %self.db_name, "postgres pool closed");
        Ok(())
    }
}
