//! Postgres access for guardian: validated pool configuration, a lifecycle unit owning the
//! pool, and schema migrations.

mod config;
mod error;
pub mod migration;
mod pool;

pub use config::PoolConfig;
pub use error::DatabaseError;
pub use migration::{run_migrations, MigrationConfig, MigrationReport};
pub use pool::PoolUnit;
