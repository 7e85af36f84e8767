//! # gpuplane
//!
//! Single-host control plane for vLLM inference containers: deploy models
//! from the HuggingFace Hub into GPU-bound docker containers, track their
//! liveness and VRAM footprint, expose aggregated telemetry, and right-size
//! deployments whose measured peak sits far below their configured budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        gpuplane                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ HTTP surface (axum)                                │  │
//! │  │ /deploy /spindown /optimize /models                │  │
//! │  │ /vram /vram/stream /vram/aggregated                │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │        │                  │                    │         │
//! │  ┌───────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │  │ Deployer  │    │  Collector   │    │ Health loop  │   │
//! │  │ admission │    │  snapshots   │    │ prune/probe/ │   │
//! │  │ ports     │    │  percentiles │    │ ring samples │   │
//! │  │ readiness │    │  attribution │    └──────────────┘   │
//! │  └───────────┘    └──────────────┘                       │
//! │        │                  │                              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ ModelRegistry (mutex, VRAM rings, running peaks)   │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │        │                  │                    │         │
//! │   docker CLI         NVML probe       vLLM /metrics      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod aggregate;
pub mod api;
pub mod deploy;
pub mod docker;
pub mod env;
pub mod gpu;
pub mod health;
pub mod hub;
pub mod optimize;
pub mod registry;
pub mod scrape;
pub mod stats;
pub mod telemetry;

pub use aggregate::{AggregatedSnapshot, Collector, DetailedSnapshot, ModelVram};
pub use api::AppState;
pub use deploy::{DeployOutcome, DeployRequest, Deployer};
pub use docker::{ContainerRuntime, DockerCli, LaunchSpec, RuntimeError};
pub use env::EnvStore;
pub use gpu::{GpuProbe, NvmlProbe, StaticProbe};
pub use hub::HubClient;
pub use registry::{container_name, DeploymentRecord, ModelRegistry};
pub use scrape::{MetricsScraper, ModelBlockData};
pub use stats::AggregatedStats;

use axum::Router;

/// Build the HTTP application over an assembled state.
pub fn build_app(state: AppState) -> Router {
    api::router(state)
}
