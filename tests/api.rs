//! Endpoint-level tests over the assembled router.
//!
//! The container runtime and GPU probe are replaced with fakes so every test
//! runs without docker or NVIDIA hardware. Deployment paths that would reach
//! the model registry are exercised only up to the steps that precede it.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gpuplane::aggregate::Collector;
use gpuplane::api::AppState;
use gpuplane::deploy::Deployer;
use gpuplane::docker::{
    ContainerRuntime, ContainerState, ContainerSummary, LaunchSpec, RuntimeError, StartOutput,
};
use gpuplane::env::EnvStore;
use gpuplane::gpu::{DeviceMemory, StaticProbe};
use gpuplane::hub::HubClient;
use gpuplane::registry::ModelRegistry;
use gpuplane::scrape::MetricsScraper;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

/// Runtime double with a fixed container population.
#[derive(Default)]
struct FakeRuntime {
    containers: Vec<(ContainerSummary, ContainerState)>,
    stop_succeeds: bool,
}

impl FakeRuntime {
    fn with_running(names_and_ports: &[(&str, u16)]) -> Self {
        let containers = names_and_ports
            .iter()
            .enumerate()
            .map(|(i, (name, port))| {
                (
                    ContainerSummary {
                        id: format!("{i:012x}"),
                        name: name.to_string(),
                        status: "Up 5 minutes".to_string(),
                        ports: format!("0.0.0.0:{port}->8000/tcp"),
                    },
                    ContainerState {
                        running: true,
                        exit_code: 0,
                        pid: 1000 + i as u32,
                    },
                )
            })
            .collect();
        Self {
            containers,
            stop_succeeds: true,
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .filter(|(_, state)| state.running)
            .map(|(summary, _)| summary.clone())
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.containers
            .iter()
            .find(|(summary, _)| summary.id == id || summary.name == id)
            .map(|(_, state)| *state)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn start(&self, _spec: &LaunchSpec) -> Result<StartOutput, RuntimeError> {
        Ok(StartOutput {
            container_id: "fedcba987654".to_string(),
            stderr: String::new(),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        if self.stop_succeeds {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        if self.stop_succeeds {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn logs(&self, _id: &str, _tail: usize) -> Result<String, RuntimeError> {
        Ok(String::new())
    }

    async fn pull(&self, _tag: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_id(&self, _tag: &str) -> Result<String, RuntimeError> {
        Ok("0123456789ab".to_string())
    }

    async fn container_id_for(&self, name: &str) -> Result<String, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .find(|(summary, _)| summary.name == name)
            .map(|(summary, _)| summary.id.clone())
            .unwrap_or_default())
    }

    async fn port_bindings(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .map(|(summary, _)| (summary.name.clone(), summary.ports.clone()))
            .collect())
    }
}

fn make_state(runtime: FakeRuntime, env: EnvStore, probe: StaticProbe) -> AppState {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
    let env = Arc::new(env);
    let probe: Arc<dyn gpuplane::gpu::GpuProbe> = Arc::new(probe);
    let registry = Arc::new(ModelRegistry::new());
    // A closed local port: any unintended Hub call fails fast instead of
    // reaching the network.
    let hub = Arc::new(HubClient::with_base("http://127.0.0.1:9").unwrap());
    let scraper = Arc::new(MetricsScraper::new("127.0.0.1").unwrap());

    let deployer = Arc::new(Deployer {
        registry: Arc::clone(&registry),
        runtime: Arc::clone(&runtime),
        hub,
        probe: Arc::clone(&probe),
        scraper: Arc::clone(&scraper),
        env: Arc::clone(&env),
        config_dir: "configs".into(),
    });
    let collector = Arc::new(Collector {
        probe,
        runtime: Arc::clone(&runtime),
        scraper,
        registry: Arc::clone(&registry),
    });

    AppState {
        deployer,
        collector,
        registry,
        runtime,
        env,
    }
}

fn default_state() -> AppState {
    make_state(
        FakeRuntime::default(),
        EnvStore::with_values(HashMap::new()),
        StaticProbe {
            memory: DeviceMemory {
                total: 16_000_000_000,
                used: 0,
                free: 16_000_000_000,
            },
            ..Default::default()
        },
    )
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn deploy_rejects_whitespace_model_id() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(post_json("/deploy", r#"{"model_id":"  "}"#))
        .await
        .unwrap();

    // Deploy always answers 200; the body carries the failure.
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(
        json["message"],
        "model_id is required or contains only whitespace"
    );
}

#[tokio::test]
async fn deploy_requires_a_token() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(post_json("/deploy", r#"{"model_id":"org/model"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], false);
    assert!(
        json["message"].as_str().unwrap().contains("hf_token is required"),
        "unexpected message: {}",
        json["message"]
    );
}

#[tokio::test]
async fn deploy_denies_when_capacity_reached() {
    let state = make_state(
        FakeRuntime::with_running(&[("vllm-org-busy", 8000)]),
        EnvStore::with_values(HashMap::from([(
            "MAX_CONCURRENT_MODELS".to_string(),
            "1".to_string(),
        )])),
        StaticProbe::default(),
    );
    let app = gpuplane::build_app(state);

    let response = app
        .oneshot(post_json(
            "/deploy",
            r#"{"model_id":"org/model","hf_token":"t"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], false);
    assert!(
        json["message"].as_str().unwrap().contains("max: 1"),
        "unexpected message: {}",
        json["message"]
    );
}

#[tokio::test]
async fn spindown_requires_a_target() {
    let app = gpuplane::build_app(default_state());

    let response = app.oneshot(post_json("/spindown", "{}")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn spindown_normalizes_model_id_to_container_name() {
    let state = make_state(
        FakeRuntime::with_running(&[("vllm-org-model", 8000)]),
        EnvStore::with_values(HashMap::new()),
        StaticProbe::default(),
    );
    let app = gpuplane::build_app(state);

    let response = app
        .oneshot(post_json("/spindown", r#"{"model_id":"org/model"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["target"], "org/model");
}

#[tokio::test]
async fn spindown_failure_is_a_server_error() {
    let mut runtime = FakeRuntime::default();
    runtime.stop_succeeds = false;
    let state = make_state(
        runtime,
        EnvStore::with_values(HashMap::new()),
        StaticProbe::default(),
    );
    let app = gpuplane::build_app(state);

    let response = app
        .oneshot(post_json("/spindown", r#"{"container_id":"vllm-ghost"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn models_lists_running_deployments() {
    let state = make_state(
        FakeRuntime::with_running(&[("vllm-org-one", 8001), ("vllm-org-two", 8002)]),
        EnvStore::with_values(HashMap::new()),
        StaticProbe::default(),
    );
    let app = gpuplane::build_app(state);

    let response = app
        .oneshot(Request::builder().uri("/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["running"], 2);
    assert_eq!(json["max_allowed"], 3);
    let models = json["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    let ids: Vec<&str> = models
        .iter()
        .map(|m| m["model_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"org-one"));
    assert!(models.iter().all(|m| m["running"] == true));
}

#[tokio::test]
async fn vram_reports_device_totals() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(Request::builder().uri("/vram").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["total_vram_bytes"], 16_000_000_000u64);
    assert_eq!(json["models"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn aggregated_clamps_zero_window_to_one_second() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/vram/aggregated?window=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["window_seconds"], 1);
    assert!(json["sample_count"].as_u64().unwrap() >= 1);
    assert_eq!(json["total_vram_bytes"], 16_000_000_000u64);
}

#[tokio::test]
async fn aggregated_stats_carry_counts() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/vram/aggregated?window=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let json = json_body(response).await;
    let count = json["sample_count"].as_u64().unwrap();
    assert_eq!(json["allocated_vram_bytes"]["count"].as_u64().unwrap(), count);
    assert_eq!(json["num_requests_waiting"]["count"].as_u64().unwrap(), count);
}

#[tokio::test]
async fn optimize_reports_no_candidates() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(post_json("/optimize", ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["optimized"], false);
    assert_eq!(json["message"], "No models need optimization");
    assert_eq!(json["restarted_models"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let app = gpuplane::build_app(default_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
