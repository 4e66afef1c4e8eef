//! HTTP front end for the Internet Connected Beverage Monitor.
//!
//! Taps POST telemetry batches to `/icbm/v1` with their API key in the
//! `x-icbm-api-key` header. Everything else is read-only status.
//!
//! Two background tasks run alongside the listener: a periodic repack of all
//! taps under a time budget, and an hourly usage summary in the log.

mod auth;
mod error;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
};
use chrono::Utc;
use icbm_core::{IngestMetrics, Ingestor, Store, TapSummary, TelemetryBatch};

pub use auth::{API_KEY_HEADER, ApiKeyTable, CredentialCheck, User};
pub use error::ServerError;

/// Listener and background task settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// JSON API key table. Without one the server refuses every upload.
    pub users_path: Option<std::path::PathBuf>,
    pub repack_every: Duration,
    /// Time budget for one repack pass over all taps.
    pub repack_budget: Duration,
    pub ingest_timeout: Duration,
    pub stats_every: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".to_string(),
            users_path: None,
            repack_every: Duration::from_secs(6 * 3600),
            repack_budget: Duration::from_secs(10 * 60),
            ingest_timeout: Duration::from_secs(10),
            stats_every: Duration::from_secs(3600),
        }
    }
}

/// Shared server state.
pub struct AppState {
    ingestor: Ingestor,
    credentials: Option<Arc<dyn CredentialCheck>>,
    ingest_timeout: Duration,
}

impl AppState {
    pub fn new(
        ingestor: Ingestor,
        credentials: Option<Arc<dyn CredentialCheck>>,
        ingest_timeout: Duration,
    ) -> Self {
        Self {
            ingestor,
            credentials,
            ingest_timeout,
        }
    }

    fn metrics(&self) -> &IngestMetrics {
        self.ingestor.metrics()
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<User, ServerError> {
        let key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let user = self.credentials.as_ref().and_then(|c| c.lookup(key));
        match user {
            Some(user) if user.valid => {
                self.metrics().api_logins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(user)
            }
            Some(user) => {
                self.metrics().bad_logins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                log::warn!("refused upload from disabled account {}", user.username);
                Err(ServerError::Forbidden(
                    "Your account is disabled, please contact the administrator if you believe this is in error"
                        .into(),
                ))
            }
            None => {
                self.metrics().bad_logins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(ServerError::Unauthorized(
                    "Fridge status not updated, please supply an API key".into(),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, ServerError> {
    if body.is_empty() {
        return Err(ServerError::BadRequest("Please send a request body".into()));
    }
    let user = state.authenticate(&headers)?;

    let batch = TelemetryBatch::from_json(&body).map_err(|e| {
        state.metrics().bad_json.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ServerError::from(e)
    })?;
    let tap = batch.tap_name.clone();

    let worker = Arc::clone(&state);
    let job = tokio::task::spawn_blocking(move || worker.ingestor.ingest(batch));
    let receipt = match tokio::time::timeout(state.ingest_timeout, job).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(ServerError::Internal(format!("ingest of {tap} failed: {e}"))),
        Err(_) => {
            return Err(ServerError::Unavailable(format!(
                "update for {tap} timed out, please retry"
            )));
        }
    };

    Ok(format!(
        "Fridge status updated for {}, thank you {}\n",
        receipt.tap, user.username
    ))
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(tap): Path<String>,
) -> Result<Json<TapSummary>, ServerError> {
    state
        .ingestor
        .registry()
        .summary(&icbm_core::sanitize(&tap))
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("no data for tap {tap:?}")))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "taps": state.ingestor.registry().len(),
        "read_only": state.credentials.is_none(),
    }))
}

async fn handle_version() -> String {
    format!("  version: {}\n", icbm_core::VERSION)
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Internet Connected Beverage Monitor",
        "version": icbm_core::VERSION,
        "taps": state.ingestor.registry().tap_names(),
        "endpoints": {
            "/": "This API index",
            "/icbm/v1": {
                "method": "POST",
                "description": "Submit a telemetry batch",
                "headers": { API_KEY_HEADER: "API key issued to the tap" },
            },
            "/status/{tap}": "Summary of a tap's recent samples",
            "/health": "Health check",
            "/version": "Server version",
        },
    }))
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/icbm/v1", post(handle_ingest))
        .route("/status/{tap}", get(handle_status))
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Repack every tap each `every`, giving each pass `budget` to finish.
pub fn spawn_repack(store: Store, every: Duration, budget: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let store = store.clone();
            let pass = tokio::task::spawn_blocking(move || {
                let deadline = Instant::now() + budget;
                icbm_core::repack_all(&store, Utc::now().date_naive(), Some(deadline))
            });
            match pass.await {
                Ok(Ok(done)) => {
                    let eras: usize = done.iter().map(|s| s.eras.len()).sum();
                    let files: usize = done.iter().map(|s| s.archived).sum();
                    log::info!("repack pass: {eras} eras written, {files} files archived");
                }
                Ok(Err(e)) => log::error!("repack pass failed: {e}"),
                Err(e) => log::error!("repack task panicked: {e}"),
            }
        }
    })
}

/// Log and reset the ingestion counters each `every`.
pub fn spawn_stats(metrics: Arc<IngestMetrics>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            interval.tick().await;
            let m = metrics.take();
            let pct = |x: Option<f64>| x.map_or_else(|| "-".to_string(), |v| format!("{v}"));
            log::info!(
                "last period: {} data points, {} logins, {} bad logins, {} bad json, {} errors; percent full min {} max {} avg {}",
                m.data_points,
                m.api_logins,
                m.bad_logins,
                m.bad_json,
                m.errors,
                pct(m.fill_min),
                pct(m.fill_max),
                pct(m.fill_avg)
            );
        }
    })
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(
    config: ServerConfig,
    ingestor: Ingestor,
    credentials: Option<Arc<dyn CredentialCheck>>,
) -> std::io::Result<()> {
    if credentials.is_none() {
        log::warn!("no API key table loaded, server will be read-only");
    }

    let repack = spawn_repack(
        ingestor.store().clone(),
        config.repack_every,
        config.repack_budget,
    );
    let stats = spawn_stats(Arc::clone(ingestor.metrics()), config.stats_every);

    let state = Arc::new(AppState::new(ingestor, credentials, config.ingest_timeout));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    log::info!("icbm listening on {}", config.listen);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    repack.abort();
    stats.abort();
    log::info!("icbm server stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("couldn't listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("shutdown requested");
}
