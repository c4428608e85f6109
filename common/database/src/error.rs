use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("postgres: {0}")]
    InvalidConfig(&'static str),

    #[error("postgres: parse connection uri: {0}")]
    InvalidUri(#[source] sqlx::Error),

    #[error("postgres: ping db: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("postgres: connect: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("postgres: set session {setting}: {source}")]
    Session {
        setting: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
