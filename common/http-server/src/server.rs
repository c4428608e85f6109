use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use lifecycle::Service;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// `host:port` to listen on. Port 0 picks a free port, see [`HttpServer::local_addr`].
    pub addr: String,
    /// How long `stop` waits for in-flight requests before aborting them. `None` waits
    /// for as long as they take.
    pub shutdown_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            shutdown_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{server}: addr cannot be empty")]
    EmptyAddr { server: String },
    #[error("{server}: listening at `{addr}`: {source}")]
    Bind {
        server: String,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{server}: already served")]
    AlreadyServed { server: String },
    #[error("{server}: not started")]
    NotStarted { server: String },
    #[error("{server}: stopped serving unexpectedly")]
    Exited { server: String },
    #[error("{server}: serving failed: {source}")]
    Serve {
        server: String,
        #[source]
        source: io::Error,
    },
    #[error("{server}: serving task aborted: {source}")]
    Aborted {
        server: String,
        #[source]
        source: JoinError,
    },
    #[error("{server}: in-flight requests not drained within {timeout:?}")]
    ShutdownTimeout { server: String, timeout: Duration },
}

/// Address the server actually listens on, known once the server started.
#[derive(Clone, Debug, Default)]
pub struct LocalAddr(Arc<OnceLock<SocketAddr>>);

impl LocalAddr {
    pub fn get(&self) -> Option<SocketAddr> {
        self.0.get().copied()
    }
}

/// Serves a [`Router`] as a lifecycle unit.
///
/// `start` binds the listener, so a port that is already taken fails the unit before it
/// ever runs. `run` returns when cancelled, or with an error if the server stops serving
/// on its own. `stop` stops accepting connections and waits for in-flight requests to
/// finish, bounded only if [`ServerConfig::shutdown_timeout`] is set.
pub struct HttpServer {
    name: String,
    config: ServerConfig,
    router: Option<Router>,
    local_addr: LocalAddr,
    shutdown: CancellationToken,
    serving: Option<JoinHandle<io::Result<()>>>,
}

impl HttpServer {
    pub fn new(name: &str, config: ServerConfig, router: Router) -> Result<Self, ServerError> {
        if config.addr.is_empty() {
            return Err(ServerError::EmptyAddr {
                server: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            config,
            router: Some(router),
            local_addr: LocalAddr::default(),
            shutdown: CancellationToken::new(),
            serving: None,
        })
    }

    /// Handle to the bound address; stays valid after the server moved into its unit.
    pub fn local_addr(&self) -> LocalAddr {
        self.local_addr.clone()
    }

    fn served(&self, joined: Result<io::Result<()>, JoinError>) -> ServerError {
        let server = self.name.clone();
        match joined {
            Ok(Ok(())) => ServerError::Exited { server },
            Ok(Err(source)) => ServerError::Serve { server, source },
            Err(source) => ServerError::Aborted { server, source },
        }
    }
}

#[async_trait]
impl Service for HttpServer {
    async fn start(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let router = self.router.take().ok_or_else(|| ServerError::AlreadyServed {
            server: self.name.clone(),
        })?;

        let bind_error = |source| ServerError::Bind {
            server: self.name.clone(),
            addr: self.config.addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;
        drop(self.local_addr.0.set(addr));

        let shutdown = self.shutdown.clone();
        let serve = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        self.serving = Some(tokio::spawn(async move { serve.await }));

        info!(server = %self.name, %addr, "server started");
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let serving = self.serving.as_mut().ok_or_else(|| ServerError::NotStarted {
            server: self.name.clone(),
        })?;

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            joined = serving => Some(joined),
        };

        match exited {
            None => Ok(()),
            Some(joined) => {
                self.serving = None;
                Err(self.served(joined).into())
            }
        }
    }

    async fn stop(&mut self, reason: Option<&anyhow::Error>) -> anyhow::Result<()> {
        match reason {
            Some(e) => warn!(server = %self.name, error = %e, "server shutdown started"),
            None => info!(server = %self.name, "server shutdown started"),
        }
        self.shutdown.cancel();

        let Some(mut serving) = self.serving.take() else {
            info!(server = %self.name, "server shutdown successful");
            return Ok(());
        };

        let joined = match self.config.shutdown_timeout {
            None => serving.await,
            Some(timeout) => match tokio::time::timeout(timeout, &mut serving).await {
                Ok(joined) => joined,
                Err(_) => {
                    serving.abort();
                    let e = ServerError::ShutdownTimeout {
                        server: self.name.clone(),
                        timeout,
                    };
                    error!(server = %self.name, error = %e, "server shutdown failed");
                    return Err(e.into());
                }
            },
        };

        match joined {
            Ok(Ok(())) => {
                info!(server = %self.name, "server shutdown successful");
                Ok(())
            }
            joined => {
                let e = self.served(joined);
                error!(server = %self.name, error = %e, "server shutdown failed");
                Err(e.into())
            }
        }
    }
}
