use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use common_database::{MigrationConfig, PoolConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`. `RUST_LOG` takes precedence when set.
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub level: String,

    #[envconfig(from = "LOG_OUT", default = "stderr")]
    pub out: LogOut,

    /// Human-friendly output instead of JSON. Development only.
    #[envconfig(from = "LOG_PRETTY", default = "false")]
    pub pretty: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOut {
    Stdout,
    Stderr,
}

impl FromStr for LogOut {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogOut::Stdout),
            "stderr" => Ok(LogOut::Stderr),
            other => Err(format!("`{other}` is not a valid output option")),
        }
    }
}

/// Configuration of `guardian server`.
#[derive(Envconfig, Clone, Debug)]
pub struct ServerCommandConfig {
    #[envconfig(nested = true)]
    pub postgres: PostgresConfig,

    #[envconfig(nested = true)]
    pub tracing: TracingConfig,

    #[envconfig(nested = true)]
    pub metrics: MetricsConfig,

    #[envconfig(nested = true)]
    pub profiling: ProfilingConfig,

    /// How long every unit gets to reach `Running` after startup.
    #[envconfig(from = "HEALTHY_TIMEOUT_SECS", default = "30")]
    pub healthy_timeout: EnvSecsDuration,

    /// How long to wait for every unit to stop. Zero waits forever.
    #[envconfig(from = "STOPPED_TIMEOUT_SECS", default = "0")]
    pub stopped_timeout: EnvSecsDuration,

    /// How long an HTTP server waits for in-flight requests when stopping. Zero waits for
    /// as long as they take.
    #[envconfig(from = "HTTP_SHUTDOWN_TIMEOUT_SECS", default = "0")]
    pub http_shutdown_timeout: EnvSecsDuration,
}

impl ServerCommandConfig {
    pub fn stopped_timeout(&self) -> Option<time::Duration> {
        Some(self.stopped_timeout.0).filter(|d| !d.is_zero())
    }

    pub fn http_shutdown_timeout(&self) -> Option<time::Duration> {
        Some(self.http_shutdown_timeout.0).filter(|d| !d.is_zero())
    }
}

/// Configuration of `guardian migration`.
#[derive(Envconfig, Clone, Debug)]
pub struct MigrationCommandConfig {
    #[envconfig(nested = true)]
    pub postgres: PostgresConfig,

    #[envconfig(from = "MIGRATION_LOCK_TIMEOUT_SECS", default = "15")]
    pub lock_timeout: EnvSecsDuration,

    /// Zero disables the statement timeout.
    #[envconfig(from = "MIGRATION_STATEMENT_TIMEOUT_SECS", default = "0")]
    pub statement_timeout: EnvSecsDuration,
}

impl MigrationCommandConfig {
    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            lock_timeout: self.lock_timeout.0,
            statement_timeout: self.statement_timeout.0,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct PostgresConfig {
    #[envconfig(from = "POSTGRES_URI", default = "")]
    pub uri: String,

    #[envconfig(from = "POSTGRES_MAX_CONNS", default = "20")]
    pub max_conns: u32,

    #[envconfig(from = "POSTGRES_MIN_CONNS", default = "4")]
    pub min_conns: u32,

    #[envconfig(from = "POSTGRES_MAX_CONN_LIFETIME_SECS", default = "3600")]
    pub max_conn_lifetime: EnvSecsDuration,

    #[envconfig(from = "POSTGRES_MAX_CONN_IDLE_SECS", default = "1800")]
    pub max_conn_idle_time: EnvSecsDuration,

    #[envconfig(from = "POSTGRES_ACQUIRE_TIMEOUT_SECS", default = "30")]
    pub acquire_timeout: EnvSecsDuration,

    #[envconfig(from = "POSTGRES_STATS_INTERVAL_SECS", default = "15")]
    pub stats_interval: EnvSecsDuration,
}

impl PostgresConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            uri: self.uri.clone(),
            max_conns: self.max_conns,
            min_conns: self.min_conns,
            max_conn_lifetime: self.max_conn_lifetime.0,
            max_conn_idle_time: self.max_conn_idle_time.0,
            acquire_timeout: self.acquire_timeout.0,
            stats_interval: self.stats_interval.0,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct TracingConfig {
    #[envconfig(from = "TRACING_ENABLED", default = "false")]
    pub enabled: bool,

    #[envconfig(from = "TRACING_CLIENT", default = "grpc")]
    pub client: TracingClient,

    /// Target URL to which the exporter sends spans.
    #[envconfig(from = "TRACING_ENDPOINT_URL", default = "http://localhost:4317")]
    pub endpoint_url: String,

    /// `key=value` pairs separated by commas, sent with every export (http client only).
    #[envconfig(from = "TRACING_HEADERS", default = "")]
    pub headers: Headers,

    /// Maximum time the exporter waits for each batch export.
    #[envconfig(from = "TRACING_TIMEOUT_SECS", default = "10")]
    pub timeout: EnvSecsDuration,

    #[envconfig(from = "TRACING_SAMPLING_RATE", default = "1.0")]
    pub sampling_rate: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingClient {
    Grpc,
    Http,
}

impl FromStr for TracingClient {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grpc" => Ok(TracingClient::Grpc),
            "http" => Ok(TracingClient::Http),
            other => Err(format!("`{other}` is not a valid client option")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(pub HashMap<String, String>);

impl FromStr for Headers {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut headers = HashMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("header `{pair}` is not a key=value pair"))?;
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Headers(headers))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct MetricsConfig {
    #[envconfig(from = "METRICS_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(from = "METRICS_ADDR", default = "127.0.0.1:9002")]
    pub addr: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProfilingConfig {
    #[envconfig(from = "PROFILING_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(from = "PROFILING_ADDR", default = "127.0.0.1:9003")]
    pub addr: String,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;

        Ok(EnvSecsDuration(time::Duration::from_secs(secs)))
    }
}
