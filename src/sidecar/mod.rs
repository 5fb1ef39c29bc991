//! Sidecar listener.
//!
//! Receives raw event payloads over HTTP, runs them through
//! parse -> validate -> publish and reports the first failure:
//!
//! - `GET /`  -> 200, empty body (liveness)
//! - `POST /` -> 201 when every event was published
//!   - 400 `Error parsing input: ...`
//!   - 400 `No events parsed`
//!   - 400 `Error validating event with ID <id>: ...`
//!   - 500 `Error publishing event with ID <id>: ...`
//! - any other method -> 405
//!
//! Events are published under the configured tenant, to each event's
//! default topic.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use dispatch_client::{JsonStreamParser, StreamParser};

use crate::bus::Transport;
use crate::config::{ConfigError, ListenerProtocol, SidecarConfig};

pub mod ingest;
pub mod listener;

pub use ingest::IngestError;

/// Errors that stop the sidecar from serving.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared per-request state.
#[derive(Clone)]
pub struct SidecarState {
    pub transport: Arc<dyn Transport>,
    /// Organization events are published under.
    pub tenant: Arc<str>,
    pub parser: Arc<dyn StreamParser>,
}

impl SidecarState {
    pub fn new(transport: Arc<dyn Transport>, tenant: impl Into<Arc<str>>) -> Self {
        Self {
            transport,
            tenant: tenant.into(),
            parser: Arc::new(JsonStreamParser),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn StreamParser>) -> Self {
        self.parser = parser;
        self
    }
}

/// Build the sidecar router.
pub fn router(state: SidecarState) -> Router {
    Router::new()
        .route(
            "/",
            get(ingest::health)
                .head(ingest::method_not_allowed)
                .post(ingest::ingest),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on whatever `config` names until `shutdown` resolves.
pub async fn serve<F>(
    config: &SidecarConfig,
    state: SidecarState,
    shutdown: F,
) -> Result<(), SidecarError>
where
    F: Future<Output = ()> + Send + 'static,
{
    match config.protocol()? {
        ListenerProtocol::Http => {
            let listener = TcpListener::bind(("0.0.0.0", config.listener_port)).await?;
            serve_tcp(listener, state, shutdown).await
        }
        ListenerProtocol::Pipe => serve_pipe(Path::new(&config.listener_pipe), state, shutdown).await,
        ListenerProtocol::Grpc => Err(ConfigError::UnsupportedProtocol("grpc".to_string()).into()),
    }
}

/// Serve over an already bound TCP listener.
pub async fn serve_tcp<F>(
    listener: TcpListener,
    state: SidecarState,
    shutdown: F,
) -> Result<(), SidecarError>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, tenant = %state.tenant, "Sidecar listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Sidecar stopped");
    Ok(())
}

/// Serve over a Unix domain socket at `path`.
#[cfg(unix)]
pub async fn serve_pipe<F>(path: &Path, state: SidecarState, shutdown: F) -> Result<(), SidecarError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let _guard = listener::prepare_socket(path)?;
    let listener = tokio::net::UnixListener::bind(path)?;
    info!(path = %path.display(), tenant = %state.tenant, "Sidecar listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Sidecar stopped");
    Ok(())
}

#[cfg(not(unix))]
pub async fn serve_pipe<F>(_path: &Path, _state: SidecarState, _shutdown: F) -> Result<(), SidecarError>
where
    F: Future<Output = ()> + Send + 'static,
{
    Err(ConfigError::UnsupportedProtocol("pipe".to_string()).into())
}
