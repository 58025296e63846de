//! HTTP and Server-Sent Events front door for the kiln execution engine.
//!
//! Clients submit a task with base64 input files, follow its checklist over
//! SSE, and fetch the final snapshot once the job is done. The server starts
//! without a sandbox backend when none is reachable; job endpoints then
//! answer 503 while `/health` explains why.

pub mod error;
pub mod sse;
pub mod types;

pub use error::{Result, ServerError};
pub use sse::SseEvent;
pub use types::{ExecuteRequest, ExecuteResponse, HealthResponse, ImproveRequest, JobView};

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use kiln_core::{Engine, JobId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Configuration for the kiln server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub enable_logging: bool,
    /// Keep-alive interval for SSE connections
    pub sse_keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 64 * 1024 * 1024,
            enable_logging: true,
            sse_keepalive_interval: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    pub fn with_sse_keepalive(mut self, interval: Duration) -> Self {
        self.sse_keepalive_interval = interval;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// `None` when no sandbox backend could be reached at startup
    pub engine: Option<Arc<Engine>>,
    pub backend_error: Option<String>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: ServerConfig) -> Self {
        Self {
            engine: Some(engine),
            backend_error: None,
            config,
        }
    }

    pub fn without_backend(error: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            engine: None,
            backend_error: Some(error.into()),
            config,
        }
    }

    fn engine(&self) -> Result<&Arc<Engine>> {
        self.engine.as_ref().ok_or_else(|| {
            ServerError::Unavailable(
                self.backend_error
                    .clone()
                    .unwrap_or_else(|| "no sandbox backend".to_string()),
            )
        })
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let (sandbox, error) = match &state.engine {
        Some(engine) => {
            let health = engine.health().await;
            let error = health.error.clone();
            (Some(health), error)
        }
        None => (None, state.backend_error.clone()),
    };
    let healthy = sandbox.as_ref().is_some_and(|h| h.reachable);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sandbox,
        error,
    })
}

async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    let engine = state.engine()?;
    if request.prompt.trim().is_empty() {
        return Err(ServerError::invalid_request("prompt must not be empty"));
    }
    let files = types::decode_files(&request.files)?;

    log::info!(
        "Received task with {} input file(s): {:.80}",
        files.len(),
        request.prompt
    );
    let task_id = engine.orchestrator().submit(request.prompt, files).await?;
    Ok(Json(ExecuteResponse { task_id }))
}

async fn improve_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Json(request): Json<ImproveRequest>,
) -> Result<Json<ExecuteResponse>> {
    let engine = state.engine()?;
    if request.instructions.trim().is_empty() {
        return Err(ServerError::invalid_request("instructions must not be empty"));
    }
    let task_id = engine
        .orchestrator()
        .improve(job_id, request.instructions)
        .await?;
    Ok(Json(ExecuteResponse { task_id }))
}

async fn job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobView>> {
    let engine = state.engine()?;
    let job = engine.orchestrator().status(job_id).await?;
    Ok(Json(JobView::from(&job)))
}

async fn events_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Response> {
    let engine = state.engine()?;
    let stream = engine
        .progress()
        .subscribe(&job_id)
        .ok_or_else(|| ServerError::JobNotFound(job_id.to_string()))?;

    log::debug!("Client subscribed to progress of job {}", job_id);
    Ok(sse::progress_response(
        stream,
        state.config.sse_keepalive_interval,
    ))
}

pub struct KilnServer {
    state: AppState,
}

impl KilnServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let config = self.state.config.clone();

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/execute", post(execute_handler))
            .route("/jobs/{id}", get(job_handler))
            .route("/jobs/{id}/improve", post(improve_handler))
            .route("/jobs/{id}/events", get(events_handler))
            .layer(DefaultBodyLimit::max(config.max_body_size))
            .with_state(self.state.clone());

        if config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health checks are frequent
                    let quiet = uri.path() == "/health";
                    if quiet {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if quiet {
                        log::debug!("Response {} completed in {:?}", request_id, duration);
                    } else {
                        log::info!(
                            "Response {} {} completed in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    }
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if config.enable_cors {
            let cors_layer = match &config.cors_origins {
                Some(origins) => {
                    let origins: std::result::Result<Vec<_>, _> =
                        origins.iter().map(|s| s.parse()).collect();
                    match origins {
                        Ok(origins) => CorsLayer::new()
                            .allow_origin(origins)
                            .allow_methods(Any)
                            .allow_headers(Any),
                        Err(_) => CorsLayer::permissive(),
                    }
                }
                None => CorsLayer::permissive(),
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Serve until `shutdown_signal` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let bind_addr = self.state.config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::config_error(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        log::info!("kiln server starting on {}", bind_addr);
        log::info!("Health check: http://{}/health", bind_addr);
        log::info!("Submit tasks: http://{}/execute", bind_addr);
        if let Some(error) = &self.state.backend_error {
            log::warn!("Serving without a sandbox backend: {}", error);
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("kiln server shut down gracefully");
        Ok(())
    }
}

/// Prune the environment cache every `interval`, first run one interval in
pub fn spawn_pruning(engine: Arc<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.cache().prune().await {
                Ok(report) => log::info!(
                    "Pruned {} container(s) and {} image(s), reclaimed {} bytes",
                    report.containers_deleted,
                    report.images_deleted,
                    report.space_reclaimed
                ),
                Err(e) => log::warn!("Periodic pruning failed: {}", e),
            }
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
