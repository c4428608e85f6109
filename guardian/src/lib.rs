pub mod buildinfo;
pub mod config;
pub mod logging;
pub mod migrate;
pub mod otel;
pub mod server;
