use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::DatabaseError;

/// Connection pool settings. Validated before any connection is attempted.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub uri: String,
    /// Maximum size of the pool.
    pub max_conns: u32,
    /// Connections kept open even when idle.
    pub min_conns: u32,
    /// Connections older than this are closed once released.
    pub max_conn_lifetime: Duration,
    /// Idle connections above `min_conns` are closed after this long.
    pub max_conn_idle_time: Duration,
    pub acquire_timeout: Duration,
    /// How often the pool unit exports pool statistics.
    pub stats_interval: Duration,
}

impl PoolConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            max_conns: 20,
            min_conns: 4,
            max_conn_lifetime: Duration::from_secs(3600),
            max_conn_idle_time: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(15),
        }
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.uri.is_empty() {
            return Err(DatabaseError::InvalidConfig("URI cannot be empty"));
        }
        if self.max_conns == 0 || self.max_conns < self.min_conns {
            return Err(DatabaseError::InvalidConfig(
                "MaxConns cannot be zero or less than MinConns",
            ));
        }
        if self.max_conn_lifetime.is_zero() {
            return Err(DatabaseError::InvalidConfig("MaxConnLifetime cannot be zero"));
        }
        if self.max_conn_idle_time.is_zero() {
            return Err(DatabaseError::InvalidConfig("MaxConnIdleTime cannot be zero"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DatabaseError::InvalidConfig("AcquireTimeout cannot be zero"));
        }
        if self.stats_interval.is_zero() {
            return Err(DatabaseError::InvalidConfig("StatsInterval cannot be zero"));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, DatabaseError> {
        self.validate()?;
        PgConnectOptions::from_str(&self.uri).map_err(DatabaseError::InvalidUri)
    }

    pub(crate) fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_conns)
            .min_connections(self.min_conns)
            .max_lifetime(self.max_conn_lifetime)
            .idle_timeout(self.max_conn_idle_time)
            .acquire_timeout(self.acquire_timeout)
            .test_before_acquire(true)
    }
}
