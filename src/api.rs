//! HTTP surface.
//!
//! | Method | Path               | Description                                |
//! |--------|--------------------|--------------------------------------------|
//! | GET    | `/vram`            | Single telemetry snapshot                  |
//! | GET    | `/vram/stream`     | SSE feed of the same snapshot every 500 ms |
//! | GET    | `/vram/aggregated` | Windowed stats, `?window=` in [1, 60] s    |
//! | GET    | `/models`          | Deployed model listing                     |
//! | POST   | `/deploy`          | Deploy a model                             |
//! | POST   | `/spindown`        | Stop and remove a deployment               |
//! | POST   | `/optimize`        | Right-size over-allocated models           |
//!
//! `/deploy` always answers 200; clients inspect the `success` field.
//! `/spindown` is the exception: a missing target is a 400 and a failed
//! spindown a 500.

use crate::aggregate::Collector;
use crate::deploy::{DeployRequest, Deployer};
use crate::docker::{live_vllm_containers, ContainerRuntime};
use crate::env::EnvStore;
use crate::optimize;
use crate::registry::ModelRegistry;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const STREAM_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_WINDOW_SECONDS: u64 = 5;

#[derive(Clone)]
pub struct AppState {
    pub deployer: Arc<Deployer>,
    pub collector: Arc<Collector>,
    pub registry: Arc<ModelRegistry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub env: Arc<EnvStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/vram", get(vram))
        .route("/vram/stream", get(vram_stream))
        .route("/vram/aggregated", get(vram_aggregated))
        .route("/models", get(list_models))
        .route("/deploy", post(deploy))
        .route("/spindown", post(spindown))
        .route("/optimize", post(run_optimize))
        .fallback(not_found)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeployBody {
    #[serde(default)]
    model_id: String,
    #[serde(default)]
    hf_token: Option<String>,
    #[serde(default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct SpindownBody {
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    container_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn vram(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.collector.detailed_snapshot().await)
}

/// Server-sent events: one snapshot every 500 ms until the peer disconnects.
/// The subscription is per-connection; dropping the stream is the only
/// termination condition.
async fn vram_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let collector = Arc::clone(&state.collector);
    let stream = stream::unfold((collector, true), |(collector, first)| async move {
        if !first {
            tokio::time::sleep(STREAM_INTERVAL).await;
        }
        let snapshot = collector.detailed_snapshot().await;
        // The stream doubles as a sampling tick for the VRAM rings.
        collector.sample_vram_rings().await;
        let payload = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Some((Ok(Event::default().data(payload)), (collector, false)))
    });
    Sse::new(stream)
}

async fn vram_aggregated(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let window = params
        .get("window")
        .and_then(|w| w.parse::<u64>().ok())
        .unwrap_or(DEFAULT_WINDOW_SECONDS);
    Json(state.collector.collect(window).await)
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let live = live_vllm_containers(state.runtime.as_ref())
        .await
        .unwrap_or_default();
    let models: Vec<_> = live
        .iter()
        .map(|c| {
            json!({
                "model_id": c.model_id,
                "container_id": c.container_id,
                "container_name": c.container_name,
                "port": c.port,
                "running": true,
            })
        })
        .collect();
    Json(json!({
        "total": live.len(),
        "running": live.len(),
        "max_allowed": state.env.max_concurrent_models(),
        "models": models,
    }))
}

async fn deploy(
    State(state): State<AppState>,
    Json(body): Json<DeployBody>,
) -> impl IntoResponse {
    info!(model = %body.model_id, port = body.port, "deploy request");
    let outcome = state
        .deployer
        .deploy(DeployRequest {
            model_id: body.model_id,
            hf_token: body.hf_token,
            port: body.port,
            gpu_type: state.env.gpu_type(),
            config_path: None,
        })
        .await;
    // Always 200: the success field carries the actual status.
    Json(outcome)
}

async fn spindown(
    State(state): State<AppState>,
    Json(body): Json<SpindownBody>,
) -> impl IntoResponse {
    let target = body
        .model_id
        .filter(|t| !t.is_empty())
        .or(body.container_id.filter(|t| !t.is_empty()));
    let Some(target) = target else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "model_id or container_id is required",
            })),
        );
    };

    info!(target = %target, "spindown request");
    if state.deployer.spindown(&target).await {
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Model spindown successful",
                "target": target,
            })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "message": format!("Failed to spindown model: {target}"),
            })),
        )
    }
}

async fn run_optimize(State(state): State<AppState>) -> impl IntoResponse {
    info!("optimize request");
    let outcome = optimize::optimize(&state.deployer, &state.collector).await;
    Json(json!({
        "success": true,
        "optimized": outcome.optimized,
        "message": outcome.message,
        "restarted_models": outcome.restarted_models,
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
