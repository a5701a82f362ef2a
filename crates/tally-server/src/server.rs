//! `TallyServer`: Axum HTTP server for counters and their event streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::counter::MemoryCounterStore;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::stream::{LifecycleCoordinator, ShutdownReport};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Stream lifecycle coordinator.
    pub lifecycle: Arc<LifecycleCoordinator>,
    /// Counter values.
    pub counters: Arc<MemoryCounterStore>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// Handle to a running listener.
pub struct ServerHandle {
    /// Bound address.
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

/// The main Tally server.
pub struct TallyServer {
    config: ServerConfig,
    lifecycle: Arc<LifecycleCoordinator>,
    counters: Arc<MemoryCounterStore>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl TallyServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            lifecycle: Arc::new(LifecycleCoordinator::new(config.stream.clone())),
            counters: Arc::new(MemoryCounterStore::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
            config,
        }
    }

    /// Serve `/metrics` from an installed Prometheus recorder.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            lifecycle: self.lifecycle.clone(),
            counters: self.counters.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/stream/{namespace}/{key}", get(routes::stream_handler))
            .route("/stream/{key}", get(routes::stream_handler))
            .route("/hit/{namespace}/{key}", get(routes::hit_handler))
            .route("/hit/{key}", get(routes::hit_handler))
            .route("/get/{namespace}/{key}", get(routes::get_handler))
            .route("/get/{key}", get(routes::get_handler))
            .route(
                "/create/{namespace}/{key}",
                get(routes::create_handler).post(routes::create_handler),
            )
            .route(
                "/create/{key}",
                get(routes::create_handler).post(routes::create_handler),
            )
            .route(
                "/create",
                get(routes::create_random_handler).post(routes::create_random_handler),
            )
            .route(
                "/create/",
                get(routes::create_random_handler).post(routes::create_random_handler),
            )
            .route("/info/{namespace}/{key}", get(routes::info_handler))
            .route("/info/{key}", get(routes::info_handler))
            .route("/delete/{namespace}/{key}", post(routes::delete_handler))
            .route("/delete/{key}", post(routes::delete_handler))
            .route("/set/{namespace}/{key}", post(routes::set_handler))
            .route("/set/{key}", post(routes::set_handler))
            .route("/reset/{namespace}/{key}", post(routes::reset_handler))
            .route("/reset/{key}", post(routes::reset_handler))
            .route("/update/{namespace}/{key}", post(routes::update_handler))
            .route("/update/{key}", post(routes::update_handler))
            .route("/stats", get(routes::stats_handler))
            .route("/health", get(routes::health_handler))
            .route("/metrics", get(routes::metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown begins.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(error) = result {
                error!(%error, "http server failed");
            }
        });
        info!(%addr, "tally server listening");
        Ok(ServerHandle { addr, server })
    }

    /// Stop accepting, close every stream, and wait for tasks to finish.
    pub async fn shutdown_gracefully(&self, handle: ServerHandle) -> ShutdownReport {
        self.shutdown
            .graceful_shutdown(&self.lifecycle, vec![handle.server], self.config.shutdown_timeout)
            .await
    }

    /// Get the lifecycle coordinator.
    pub fn lifecycle(&self) -> &Arc<LifecycleCoordinator> {
        &self.lifecycle
    }

    /// Get the counter store.
    pub fn counters(&self) -> &Arc<MemoryCounterStore> {
        &self.counters
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
