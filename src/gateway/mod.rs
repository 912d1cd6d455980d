//! Axum-based HTTP binding of the engine.
//!
//! - Request body size limit (`gateway.max_body_bytes`)
//! - Request timeout (`gateway.request_timeout_secs`); the worker job still
//!   runs to completion if a caller gives up
//! - Permissive CORS so the desktop frontend can call the sidecar directly
//!
//! Errors are rendered by [`EngineError`] as `{"kind", "detail"}`.

use crate::backends::{BackendFactory, BackendKind, EngineFactory, LoadOptions, OllamaClient, RemoteGenerator};
use crate::compliance::{
    BackgroundLoader, ClassifierContext, ComplianceScorer, HfClassifierLoader, Readiness,
};
use crate::config::{expand_path, Config};
use crate::dispatch::{BackendSelector, QueryDispatcher, QueryRequest};
use crate::error::EngineError;
use crate::slot::ModelSlotManager;
use crate::worker::WorkerPool;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub slots: Arc<ModelSlotManager>,
    pub dispatcher: Arc<QueryDispatcher>,
    pub scorer: Arc<ComplianceScorer>,
    pub remote: Arc<dyn RemoteGenerator>,
    pub classifier: Arc<ClassifierContext>,
    /// Construction defaults; `gpu_layers` is filled per request.
    pub load_defaults: LoadOptions,
    pub default_max_tokens: u32,
    pub workers: WorkerPool,
}

impl AppState {
    pub fn new(
        config: &Config,
        factory: Arc<dyn BackendFactory>,
        remote: Arc<dyn RemoteGenerator>,
        classifier: Arc<ClassifierContext>,
    ) -> Self {
        let workers = WorkerPool::new(config.workers.max_concurrent);
        let slots = Arc::new(ModelSlotManager::new(factory, workers.clone()));
        let dispatcher = Arc::new(QueryDispatcher::new(
            Arc::clone(&slots),
            Arc::clone(&remote),
            workers.clone(),
            config.generation.stop_sequences.clone(),
        ));
        let scorer = Arc::new(ComplianceScorer::new(
            Arc::clone(&classifier),
            workers.clone(),
            config.classifier.max_sequence_length,
        ));
        Self {
            slots,
            dispatcher,
            scorer,
            remote,
            classifier,
            load_defaults: LoadOptions::from_config(&config.generation),
            default_max_tokens: config.generation.default_max_tokens,
            workers,
        }
    }
}

/// Routes plus middleware, without binding a socket.
pub fn router(state: AppState, config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/load-model", post(handle_load_model))
        .route("/unload-model", post(handle_unload_model))
        .route("/model-status", get(handle_model_status))
        .route("/query-local", post(handle_query_local))
        .route("/evaluate-compliance", post(handle_evaluate_compliance))
        .route("/classifier-status", get(handle_classifier_status))
        .route("/remote-models", get(handle_remote_models))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(config.gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.gateway.request_timeout_secs),
        ))
}

/// Build the engine, start the classifier load, and serve until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let classifier = Arc::new(ClassifierContext::new());
    let remote: Arc<dyn RemoteGenerator> = Arc::new(OllamaClient::from_config(&config.remote));
    let state = AppState::new(&config, Arc::new(EngineFactory), remote, Arc::clone(&classifier));

    if config.classifier.enabled {
        let loader = Arc::new(HfClassifierLoader::new(config.classifier_dir()));
        BackgroundLoader::spawn(classifier, loader, state.workers.clone());
    } else {
        BackgroundLoader::disabled(&classifier);
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(
        addr = %local,
        workers = state.workers.capacity(),
        remote = %config.remote.url,
        "Engine listening"
    );

    let app = router(state, &config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl-C handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Malformed JSON bodies are reported like any other bad input.
fn bad_body(rejection: JsonRejection) -> EngineError {
    EngineError::Configuration(rejection.body_text())
}

// ══════════════════════════════════════════════════════════════════════════════
// MODEL SLOT
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct LoadModelBody {
    pub path: String,
    #[serde(alias = "model_type")]
    pub backend_kind: BackendKind,
    /// File-backed models only.
    #[serde(default)]
    pub gpu_layers: Option<u32>,
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /load-model
async fn handle_load_model(
    State(state): State<AppState>,
    body: Result<Json<LoadModelBody>, JsonRejection>,
) -> Result<impl IntoResponse, EngineError> {
    let Json(body) = body.map_err(bad_body)?;
    if body.path.trim().is_empty() {
        return Err(EngineError::Configuration("model path cannot be empty".into()));
    }
    if body.gpu_layers.is_some() && body.backend_kind != BackendKind::File {
        tracing::debug!("Ignoring gpu_layers for a {} model", body.backend_kind);
    }

    let options = LoadOptions {
        gpu_layers: match body.backend_kind {
            BackendKind::File => body.gpu_layers.unwrap_or(0),
            BackendKind::Directory => 0,
        },
        ..state.load_defaults.clone()
    };
    let receipt = state
        .slots
        .load(expand_path(&body.path), body.backend_kind, options)
        .await?;

    Ok(Json(serde_json::json!({
        "status": "loaded",
        "backend_kind": receipt.backend_kind,
        "identifier": receipt.identifier,
        "load_id": receipt.load_id,
        "replaced": receipt.replaced,
    })))
}

/// POST /unload-model
async fn handle_unload_model(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.slots.unload().await;
    Json(serde_json::json!({ "status": outcome.as_status() }))
}

/// GET /model-status
async fn handle_model_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.slots.status())
}

// ══════════════════════════════════════════════════════════════════════════════
// QUERY
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "model_path")]
    pub file_model_path: Option<String>,
    #[serde(default, alias = "ollama_model")]
    pub remote_model_name: Option<String>,
}

impl QueryBody {
    fn into_request(self, default_max_tokens: u32) -> QueryRequest {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        QueryRequest {
            prompt: self.prompt,
            max_tokens: self.max_tokens.unwrap_or(default_max_tokens),
            selector: BackendSelector {
                file_model: non_blank(self.file_model_path).map(|p| expand_path(&p)),
                remote_model: non_blank(self.remote_model_name),
            },
        }
    }
}

/// POST /query-local
async fn handle_query_local(
    State(state): State<AppState>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<impl IntoResponse, EngineError> {
    let Json(body) = body.map_err(bad_body)?;
    let text = state
        .dispatcher
        .query(body.into_request(state.default_max_tokens))
        .await?;
    Ok(Json(serde_json::json!({ "response": text })))
}

/// GET /remote-models
async fn handle_remote_models(State(state): State<AppState>) -> Result<impl IntoResponse, EngineError> {
    let models = state.remote.list_models().await.map_err(|e| {
        tracing::warn!("Listing remote models failed: {e:#}");
        EngineError::inference(&e)
    })?;
    Ok(Json(serde_json::json!({ "models": models })))
}

// ══════════════════════════════════════════════════════════════════════════════
// COMPLIANCE
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct ComplianceBody {
    pub prompt: String,
    pub response: String,
}

/// POST /evaluate-compliance
async fn handle_evaluate_compliance(
    State(state): State<AppState>,
    body: Result<Json<ComplianceBody>, JsonRejection>,
) -> Result<impl IntoResponse, EngineError> {
    let Json(body) = body.map_err(bad_body)?;
    let result = state.scorer.evaluate(body.prompt, body.response).await?;
    Ok(Json(result))
}

/// GET /classifier-status
async fn handle_classifier_status(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state.classifier.readiness();
    let detail = match &readiness {
        Readiness::Failed(reason) => Some(reason.clone()),
        Readiness::Loading | Readiness::Ready => None,
    };
    Json(serde_json::json!({
        "status": readiness.label(),
        "detail": detail,
    }))
}
