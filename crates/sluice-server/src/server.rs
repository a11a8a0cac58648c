use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sluice_hub::StreamHub;

use crate::handlers;
use crate::pipeline::PipelineRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval of SSE keep-alive comments; `None` disables them.
    pub keep_alive: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StreamHub>,
    pub pipelines: Arc<PipelineRegistry>,
    pub keep_alive: Option<Duration>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/v1/stats", get(handlers::stats_handler))
        .route("/v1/jobs/{key}", get(handlers::job_handler))
        .route("/v1/pipelines/{name}/stream", post(handlers::stream_handler))
        .route("/v1/pipelines/{name}/invoke", post(handlers::invoke_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve in the background.
pub async fn start(
    config: ServerConfig,
    hub: Arc<StreamHub>,
    pipelines: PipelineRegistry,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        hub,
        pipelines: Arc::new(pipelines),
        keep_alive: config.keep_alive,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(%local_addr, "sluice server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait up to `grace` for open responses
    /// to complete. Returns `false` if the wait timed out.
    pub async fn stop(self, grace: Duration) -> bool {
        self.shutdown.cancel();
        match tokio::time::timeout(grace, self.server).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "server did not drain in time");
                false
            }
        }
    }
}
