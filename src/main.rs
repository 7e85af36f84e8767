//! gpuplane - GPU-model control plane for vLLM containers
//!
//! This binary deploys and observes vLLM inference containers on a single
//! NVIDIA host: validation against the HuggingFace Hub, port assignment,
//! container lifecycle, VRAM telemetry, and peak-driven right-sizing.

use anyhow::{Context, Result};
use clap::Parser;
use gpuplane::aggregate::Collector;
use gpuplane::api::AppState;
use gpuplane::deploy::Deployer;
use gpuplane::docker::{ContainerRuntime, DockerCli};
use gpuplane::env::EnvStore;
use gpuplane::gpu::{DeviceMemory, GpuProbe, NvmlProbe, StaticProbe};
use gpuplane::hub::HubClient;
use gpuplane::registry::ModelRegistry;
use gpuplane::scrape::MetricsScraper;
use gpuplane::{health, telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpuplane")]
#[command(about = "GPU-model control plane for vLLM containers")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6767)]
    port: u16,

    /// Directory holding per-GPU vLLM config files ({A100,H100,L40,T4}.yaml)
    #[arg(long, default_value = "configs")]
    config_dir: PathBuf,

    /// Serve Prometheus metrics for the daemon itself on this port (0 disables)
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run with a simulated GPU instead of NVML (development hosts)
    #[arg(long)]
    mock_gpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = Arc::new(EnvStore::load());

    init_tracing(&args, &env);
    info!("Starting gpuplane");

    let metrics_handle = telemetry::install();

    let probe: Arc<dyn GpuProbe> = if args.mock_gpu {
        info!("using simulated GPU probe");
        Arc::new(StaticProbe {
            memory: DeviceMemory {
                total: 16 * 1024 * 1024 * 1024,
                used: 0,
                free: 16 * 1024 * 1024 * 1024,
            },
            processes: Vec::new(),
            devices: 1,
            name: Some("Tesla T4 (simulated)".to_string()),
        })
    } else {
        Arc::new(NvmlProbe::init().context("GPU probe initialization failed")?)
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::resolve(&env).await);
    let registry = Arc::new(ModelRegistry::new());
    let hub = Arc::new(HubClient::new().context("failed to build Hub client")?);
    let scraper = Arc::new(
        MetricsScraper::new(env.vllm_host()).context("failed to build metrics client")?,
    );

    let deployer = Arc::new(Deployer {
        registry: Arc::clone(&registry),
        runtime: Arc::clone(&runtime),
        hub,
        probe: Arc::clone(&probe),
        scraper: Arc::clone(&scraper),
        env: Arc::clone(&env),
        config_dir: args.config_dir.clone(),
    });
    let collector = Arc::new(Collector {
        probe,
        runtime: Arc::clone(&runtime),
        scraper,
        registry: Arc::clone(&registry),
    });

    let _health_handle = health::spawn(Arc::clone(&collector));

    if let Some(handle) = metrics_handle {
        if args.metrics_port != 0 {
            let addr = format!("0.0.0.0:{}", args.metrics_port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind metrics to {addr}"))?;
            info!(addr = %addr, "Serving daemon metrics");
            let app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            });
        }
    }

    let state = AppState {
        deployer,
        collector,
        registry,
        runtime,
        env,
    };
    let app = gpuplane::build_app(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Tracing filter: `-v` wins, then `LOG_LEVEL` (DEBUG|INFO|WARN|ERROR,
/// case-insensitive), then `RUST_LOG`, then info.
fn init_tracing(args: &Args, env: &EnvStore) {
    let filter = if args.verbose {
        EnvFilter::new("gpuplane=debug")
    } else if let Some(level) = env.log_level() {
        let level = match level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        };
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
