//! HTTP surface exposing the Engine API (spec §6): `submit` / `await` /
//! `cancel` / `step.continue` / `step.reset`, plus debug-bundle export.
//!
//! This binary is a thin transport shim. Every request maps directly onto a
//! `flow_core::Engine` call; it holds no workflow/execution state of its
//! own beyond the `Engine` handle itself.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flow_core::{Engine, EngineError, SubmitOptions};
use flow_workflow::{NodeMap, TriggerType, Workflow};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    engine: Engine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dev_mode = std::env::var("FLOW_DEV_MODE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let engine = Engine::core(dev_mode);
    let state = AppState { engine };

    let app = Router::new()
        .route("/executions", post(submit))
        .route("/executions/:id", get(await_execution))
        .route("/executions/:id/cancel", post(cancel))
        .route("/executions/:id/step/continue", post(step_continue))
        .route("/executions/:id/step/reset", post(step_reset))
        .route("/executions/:id/debug-bundle", get(debug_bundle))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = std::env::var("FLOW_SERVER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    info!("workflow execution engine listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    workflow: Workflow,
    #[serde(default)]
    input: NodeMap,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    step_mode: bool,
    /// Seconds, matching the persisted format's other timestamps' unit
    /// conventions.
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    trigger_type: TriggerType,
}

async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    let opts = SubmitOptions {
        dry_run: req.dry_run,
        step_mode: req.step_mode,
        timeout: req.timeout_secs.map(std::time::Duration::from_secs),
        trigger_type: req.trigger_type,
    };
    match state.engine.submit(req.workflow, req.input, opts) {
        Ok(execution_id) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "executionId": execution_id }))).into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn await_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.await_execution(&id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.cancel(&id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn step_continue(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.step_continue(&id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn step_reset(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.step_reset(&id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn debug_bundle(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.debug_bundle(&id) {
        Ok(Some(bundle)) => Json(bundle).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "dev mode was not enabled for this execution").into_response(),
        Err(e) => engine_error_response(e),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Validation(_) | EngineError::Expression(_) => StatusCode::BAD_REQUEST,
        EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NotPaused(_) => StatusCode::CONFLICT,
        EngineError::Node(_) | EngineError::InternalInconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
