//! Administrative HTTP server.
//!
//! Exposes refresh triggering, retrieval and store statistics as a small
//! JSON API. The refresh timer runs in the same process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version and run state) |
//! | `POST` | `/refresh?full=` | Run a refresh now; `202` with the summary |
//! | `GET`  | `/retrieve?q=&budget=` | Budgeted excerpts for a query |
//! | `GET`  | `/stats` | Entry counts and last refresh time |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "already_running", "message": "a refresh is already in progress" } }
//! ```
//!
//! Error codes: `bad_request` (400), `already_running` (409),
//! `enumeration_failed` (502), `store_unavailable` (503), `internal` (500).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{RefreshError, StoreError};
use crate::retrieve::{format_for_prompt, Retriever};
use crate::scheduler::{RefreshScheduler, RefreshSummary, RunMode, RunOutcome, RunState, Trigger};
use crate::store::sqlite::SqliteStore;
use crate::store::{KnowledgeStore, StoreStats};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KnowledgeStore>,
    pub scheduler: Arc<RefreshScheduler>,
    pub retriever: Arc<Retriever>,
    /// Budget used when `/retrieve` is called without `budget`.
    pub default_budget: usize,
}

/// Build the API router. Used by [`run_server`] and by tests.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/refresh", post(handle_refresh))
        .route("/retrieve", get(handle_retrieve))
        .route("/stats", get(handle_stats))
        .layer(cors)
        .with_state(state)
}

/// `kb serve`: bind `[server].bind`, run the refresh timer alongside, and
/// shut both down on Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let sqlite = Arc::new(SqliteStore::open(config).await?);
    let store: Arc<dyn KnowledgeStore> = sqlite.clone();
    let scheduler = Arc::new(RefreshScheduler::from_config(config, store.clone())?);
    let retriever = Arc::new(Retriever::from_config(&config.retrieval, store.clone()));

    let state = AppState {
        store,
        scheduler: scheduler.clone(),
        retriever,
        default_budget: config.retrieval.token_budget,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.refresh.check_interval_secs);
    let timer = tokio::spawn(scheduler.run_scheduled(interval, shutdown_rx));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("kb server listening on http://{}", listener.local_addr()?);
    info!(bind = %config.server.bind, "server started");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let _ = shutdown_tx.send(true);
    timer.await?;
    sqlite.close().await;
    served?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"already_running"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn already_running() -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "already_running".to_string(),
        message: "a refresh is already in progress".to_string(),
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let (status, code) = match &err {
            StoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<RefreshError> for AppError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Store(e) => e.into(),
            RefreshError::Enumeration(e) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "enumeration_failed".to_string(),
                message: e.to_string(),
            },
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    refresh: RunState,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        refresh: state.scheduler.state(),
    })
}

// ============ POST /refresh ============

#[derive(Deserialize, Default)]
struct RefreshParams {
    #[serde(default)]
    full: bool,
}

/// Runs the refresh to completion before answering. A trigger that arrives
/// while a run is in progress is rejected, not queued.
async fn handle_refresh(
    State(state): State<AppState>,
    Query(params): Query<RefreshParams>,
) -> Result<(StatusCode, Json<RefreshSummary>), AppError> {
    let mode = if params.full {
        RunMode::Full
    } else {
        RunMode::Incremental
    };
    match state.scheduler.trigger(Trigger::Manual, mode).await {
        Ok(RunOutcome::Completed(summary)) => Ok((StatusCode::ACCEPTED, Json(summary))),
        Ok(RunOutcome::AlreadyRunning) => Err(already_running()),
        Err(e) => {
            error!(error = %e, "refresh via API failed");
            Err(e.into())
        }
    }
}

// ============ GET /retrieve ============

#[derive(Deserialize)]
struct RetrieveParams {
    #[serde(default)]
    q: String,
    budget: Option<usize>,
}

#[derive(Serialize)]
struct RetrieveResponse {
    #[serde(flatten)]
    outcome: crate::retrieve::RetrievalOutcome,
    budget: usize,
    /// Excerpts rendered as an attributed prompt block.
    prompt: String,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Query(params): Query<RetrieveParams>,
) -> Result<Json<RetrieveResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let budget = params.budget.unwrap_or(state.default_budget);
    let outcome = state.retriever.retrieve_with_report(&params.q, budget).await?;
    let prompt = format_for_prompt(&outcome.excerpts);
    Ok(Json(RetrieveResponse {
        outcome,
        budget,
        prompt,
    }))
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    Ok(Json(state.store.stats().await?))
}
