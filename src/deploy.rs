//! Deployment coordinator.
//!
//! Drives one deployment end to end: admission against the concurrency
//! limit, port assignment, model validation against the Hub, GPU config
//! selection, image pull, container launch, readiness probing, and registry
//! bookkeeping. A container in `Running` state is a successful deployment
//! even before the API answers health checks; large models need minutes to
//! load weights.

use crate::docker::{
    self, ContainerRuntime, LaunchSpec, RuntimeError, StartOutput, VLLM_IMAGE,
};
use crate::env::EnvStore;
use crate::gpu::GpuProbe;
use crate::hub::HubClient;
use crate::registry::{container_name, DeploymentRecord, ModelRegistry};
use crate::scrape::MetricsScraper;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READINESS_CHECKS: u32 = 3;
const READINESS_PAUSE: Duration = Duration::from_secs(3);
const FAILURE_LOG_TAIL: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Cannot deploy: {current} models already deployed (max: {max})")]
    AdmissionDenied { current: usize, max: usize },

    #[error("Port {port} is already in use by container: {container}")]
    PortInUse { port: u16, container: String },

    #[error("Model validation failed: {0}")]
    Validation(String),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to pull required Docker image: {0}")]
    ImagePull(String),

    #[error("Deployment failed: {0}")]
    FailedToStart(String),
}

#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub model_id: String,
    pub hf_token: Option<String>,
    /// Preferred host port; 0 means auto-assign.
    pub port: u16,
    pub gpu_type: Option<String>,
    /// Overrides per-GPU config lookup, used by the right-sizing restart.
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub success: bool,
    pub message: String,
    pub container_id: String,
    pub port: u16,
}

pub struct Deployer {
    pub registry: Arc<ModelRegistry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub hub: Arc<HubClient>,
    pub probe: Arc<dyn GpuProbe>,
    pub scraper: Arc<MetricsScraper>,
    pub env: Arc<EnvStore>,
    pub config_dir: PathBuf,
}

impl Deployer {
    /// Deploy a model. Failures are reported in the outcome message; the
    /// HTTP layer always answers 200 and clients inspect `success`.
    pub async fn deploy(&self, request: DeployRequest) -> DeployOutcome {
        let requested_port = request.port;
        let started = Instant::now();
        let outcome = match self.try_deploy(request).await {
            Ok(outcome) => outcome,
            Err(e) => DeployOutcome {
                success: false,
                message: e.to_string(),
                container_id: String::new(),
                port: requested_port,
            },
        };
        histogram!("gpuplane_deploy_duration_seconds").record(started.elapsed().as_secs_f64());
        if outcome.success {
            counter!("gpuplane_deploys_total").increment(1);
        } else {
            counter!("gpuplane_deploy_failures_total").increment(1);
        }
        outcome
    }

    async fn try_deploy(&self, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
        let model_id = request.model_id.trim().to_string();
        if model_id.is_empty() {
            return Err(DeployError::BadRequest(
                "model_id is required or contains only whitespace".to_string(),
            ));
        }

        let token = request
            .hf_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| self.env.hf_token())
            .ok_or_else(|| {
                DeployError::BadRequest(
                    "hf_token is required (provide in request or set HF_TOKEN in .env)"
                        .to_string(),
                )
            })?;

        // Admission against the currently running deployments.
        let live = docker::live_vllm_containers(self.runtime.as_ref()).await?;
        let max = self.env.max_concurrent_models();
        if live.len() >= max {
            return Err(DeployError::AdmissionDenied {
                current: live.len(),
                max,
            });
        }

        let mut used: HashSet<u16> = live.iter().map(|c| c.port).collect();
        used.extend(self.registry.used_ports());
        let port = select_port(request.port, &used, self.env.start_port());
        if request.port > 0 && port != request.port {
            warn!(
                requested = request.port,
                assigned = port,
                "requested port is in use, reassigned"
            );
        }

        let info = self.hub.validate(&model_id, &token).await;
        if !info.valid {
            let mut message = info
                .error
                .unwrap_or_else(|| "Model not found".to_string());
            if !info.id.is_empty() && info.id != model_id {
                message.push_str(&format!(" (Did you mean: {}?)", info.id));
            }
            return Err(DeployError::Validation(message));
        }
        let model_id = info.id;
        if info.gated {
            debug!(model = %model_id, "model is gated, token must have access");
        }

        let name = container_name(&model_id);

        // Another container may already map the chosen host port.
        let needle = format!(":{port}");
        for (other, ports) in self.runtime.port_bindings().await? {
            if other != name && ports.contains(&needle) {
                return Err(DeployError::PortInUse {
                    port,
                    container: other,
                });
            }
        }

        let gpu_type = request
            .gpu_type
            .filter(|g| !g.is_empty())
            .or_else(|| self.env.gpu_type())
            .unwrap_or_else(|| {
                detect_gpu_type(self.probe.device_name().as_deref()).to_string()
            });
        let config_path = request
            .config_path
            .unwrap_or_else(|| config_path_for_gpu(&self.config_dir, &gpu_type));
        let budget = budget_from_config(&config_path);

        let tensor_parallel = tensor_parallel(
            self.env.tensor_parallel_size(),
            self.probe.device_count(),
        );

        info!(
            model = %model_id,
            container = %name,
            port,
            gpu = %gpu_type,
            tensor_parallel,
            config = %config_path.display(),
            "starting deployment"
        );

        self.ensure_image().await?;

        // Idempotent replace: drop any container already holding the name.
        match self.runtime.container_id_for(&name).await {
            Ok(existing) if !existing.is_empty() => {
                warn!(container = %name, "replacing existing container");
                let _ = self.runtime.stop(&name).await;
                let _ = self.runtime.remove(&name).await;
            }
            _ => {}
        }

        let spec = LaunchSpec {
            image: VLLM_IMAGE.to_string(),
            container_name: name.clone(),
            host_port: port,
            model_id: model_id.clone(),
            hf_token: token,
            config_path,
            tensor_parallel,
        };
        let StartOutput {
            container_id,
            stderr,
        } = self.runtime.start(&spec).await?;

        let container_id = if container_id.is_empty() {
            self.runtime
                .container_id_for(&name)
                .await
                .unwrap_or_default()
        } else {
            container_id
        };
        if container_id.is_empty() {
            let detail = if stderr.trim().is_empty() {
                "no container id in runtime output".to_string()
            } else {
                truncate(stderr.trim(), 200)
            };
            return Err(DeployError::FailedToStart(detail));
        }
        info!(container = %container_id, "container started");

        let (running, failure_detail) = self.await_running(&container_id).await;
        let pid = self.resolve_pid(&container_id).await;

        // Best effort: a running container whose API is still loading is a
        // successful deployment.
        let healthy = running && self.scraper.health(port).await;

        self.registry.register(DeploymentRecord::new(
            model_id.clone(),
            container_id.clone(),
            port,
            gpu_type,
            pid,
            budget,
        ));

        let outcome = if running && healthy {
            DeployOutcome {
                success: true,
                message: format!(
                    "Model deployed successfully. Container: {container_id} (running and healthy)"
                ),
                container_id,
                port,
            }
        } else if running {
            DeployOutcome {
                success: true,
                message: format!(
                    "Container started: {container_id} on port {port}. API is still loading \
                     (this is normal for large models and may take 5-10+ minutes). \
                     Check status with: docker logs {container_id}"
                ),
                container_id,
                port,
            }
        } else {
            let mut message = format!(
                "Container created: {container_id} but failed to start. \
                 Check logs with: docker logs {container_id}"
            );
            if !failure_detail.is_empty() {
                message.push_str("\n");
                message.push_str(&truncate(&failure_detail, 1000));
            }
            DeployOutcome {
                success: false,
                message,
                container_id,
                port,
            }
        };

        if outcome.success {
            info!(container = %outcome.container_id, port, healthy, "deployment successful");
        } else {
            warn!(container = %outcome.container_id, "deployment failed: container not running");
        }
        Ok(outcome)
    }

    /// Stop and remove a deployment. The target may be a model id or a
    /// container name. Succeeds when either runtime call succeeded.
    pub async fn spindown(&self, target: &str) -> bool {
        let name = if target.starts_with("vllm-") {
            target.to_string()
        } else {
            container_name(target)
        };
        info!(container = %name, "spinning down");
        self.registry.unregister(&name);

        let stopped = self.runtime.stop(&name).await.is_ok();
        let removed = self.runtime.remove(&name).await.is_ok();
        let ok = stopped || removed;
        if ok {
            counter!("gpuplane_spindowns_total").increment(1);
        } else {
            warn!(container = %name, "spindown found nothing to stop or remove");
        }
        ok
    }

    async fn ensure_image(&self) -> Result<(), DeployError> {
        let id = self.runtime.image_id(VLLM_IMAGE).await?;
        if !id.is_empty() {
            debug!(image = VLLM_IMAGE, "image already present");
            return Ok(());
        }
        info!(image = VLLM_IMAGE, "pulling image (this may take a while)");
        self.runtime
            .pull(VLLM_IMAGE)
            .await
            .map_err(|e| DeployError::ImagePull(format!("{VLLM_IMAGE} ({e})")))
    }

    /// Wait out the container's first second, then poll the running flag up
    /// to three times. A container seen in `Exited` or `Created` contributes
    /// its last log lines to the failure detail.
    async fn await_running(&self, container_id: &str) -> (bool, String) {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut failure_detail = String::new();
        for check in 0..READINESS_CHECKS {
            match self.runtime.inspect(container_id).await {
                Ok(state) if state.running => return (true, String::new()),
                Ok(state) => {
                    debug!(
                        container = %container_id,
                        check = check + 1,
                        exit_code = state.exit_code,
                        "container not running yet"
                    );
                    if failure_detail.is_empty() {
                        failure_detail = self
                            .runtime
                            .logs(container_id, FAILURE_LOG_TAIL)
                            .await
                            .unwrap_or_default();
                    }
                }
                Err(e) => {
                    debug!(container = %container_id, error = %e, "readiness inspect failed");
                }
            }
            if check + 1 < READINESS_CHECKS {
                tokio::time::sleep(READINESS_PAUSE).await;
            }
        }
        (false, failure_detail)
    }

    /// Host PID of the container's main process, retrying once when the
    /// runtime has not filled it in yet.
    async fn resolve_pid(&self, container_id: &str) -> u32 {
        for attempt in 0..2 {
            match self.runtime.inspect(container_id).await {
                Ok(state) if state.pid > 0 => return state.pid,
                _ if attempt == 0 => tokio::time::sleep(Duration::from_secs(1)).await,
                _ => {}
            }
        }
        0
    }
}

/// Choose a host port: the requested one when free, otherwise the smallest
/// free port scanning up from `start` (bounded at +1000).
pub fn select_port(requested: u16, used: &HashSet<u16>, start: u16) -> u16 {
    if requested > 0 && !used.contains(&requested) {
        return requested;
    }
    let limit = start.saturating_add(1000);
    let mut port = start;
    while port < limit {
        if !used.contains(&port) {
            return port;
        }
        port += 1;
    }
    start
}

/// Map a device name to a config family. Unknown hardware runs with the
/// conservative T4 profile.
pub fn detect_gpu_type(device_name: Option<&str>) -> &'static str {
    let Some(name) = device_name else {
        return "T4";
    };
    for family in ["A100", "H100", "L40", "T4"] {
        if name.contains(family) {
            return family;
        }
    }
    "T4"
}

/// `{dir}/{gpu}.yaml` when present, else the T4 fallback.
pub fn config_path_for_gpu(dir: &Path, gpu_type: &str) -> PathBuf {
    let candidate = dir.join(format!("{gpu_type}.yaml"));
    if candidate.is_file() {
        candidate
    } else {
        dir.join("T4.yaml")
    }
}

/// Read `gpu-memory-utilization` from a vLLM config, accepting the
/// underscore and legacy key spellings. Unreadable configs default to 0.95.
pub fn budget_from_config(path: &Path) -> f64 {
    let Ok(text) = std::fs::read_to_string(path) else {
        return 0.95;
    };
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
        return 0.95;
    };
    for key in [
        "gpu-memory-utilization",
        "gpu_memory_utilization",
        "max_gpu_utilization",
    ] {
        if let Some(value) = doc.get(key).and_then(serde_yaml::Value::as_f64) {
            return value;
        }
    }
    0.95
}

/// Tensor-parallel size: the env override clamped to the detected GPU count,
/// defaulting to all GPUs.
pub fn tensor_parallel(env_override: Option<usize>, gpu_count: u32) -> usize {
    let gpus = gpu_count.max(1) as usize;
    match env_override {
        Some(n) => n.clamp(1, gpus),
        None => gpus,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn requested_free_port_wins() {
        let used = HashSet::from([8000, 8001]);
        assert_eq!(select_port(8005, &used, 8000), 8005);
    }

    #[test]
    fn scan_finds_smallest_free_port() {
        // Ports 8001-8003 busy, nothing requested: the scan starts at 8000.
        let used = HashSet::from([8001, 8002, 8003]);
        assert_eq!(select_port(0, &used, 8000), 8000);

        let used = HashSet::from([8000, 8001]);
        assert_eq!(select_port(0, &used, 8000), 8002);
    }

    #[test]
    fn busy_requested_port_falls_back_to_scan() {
        let used = HashSet::from([8005]);
        assert_eq!(select_port(8005, &used, 8000), 8000);
    }

    #[test]
    fn gpu_type_detection_matches_known_families() {
        assert_eq!(detect_gpu_type(Some("NVIDIA A100-SXM4-80GB")), "A100");
        assert_eq!(detect_gpu_type(Some("NVIDIA H100 PCIe")), "H100");
        assert_eq!(detect_gpu_type(Some("NVIDIA L40S")), "L40");
        assert_eq!(detect_gpu_type(Some("Tesla T4")), "T4");
        assert_eq!(detect_gpu_type(Some("GeForce RTX 4090")), "T4");
        assert_eq!(detect_gpu_type(None), "T4");
    }

    #[test]
    fn tensor_parallel_clamps_to_gpu_count() {
        assert_eq!(tensor_parallel(None, 4), 4);
        assert_eq!(tensor_parallel(Some(2), 4), 2);
        assert_eq!(tensor_parallel(Some(8), 4), 4);
        assert_eq!(tensor_parallel(Some(0), 4), 1);
        assert_eq!(tensor_parallel(None, 0), 1);
    }

    #[test]
    fn budget_reads_all_key_spellings() {
        let dir = tempfile::tempdir().unwrap();
        for (file, body, expected) in [
            ("a.yaml", "gpu-memory-utilization: 0.8\n", 0.8),
            ("b.yaml", "gpu_memory_utilization: 0.7\n", 0.7),
            ("c.yaml", "max_gpu_utilization: 0.6\n", 0.6),
            ("d.yaml", "other-key: 1\n", 0.95),
        ] {
            let path = dir.path().join(file);
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(body.as_bytes()).unwrap();
            assert_eq!(budget_from_config(&path), expected, "{file}");
        }
    }

    #[test]
    fn missing_config_defaults_to_095() {
        assert_eq!(budget_from_config(Path::new("/nonexistent/x.yaml")), 0.95);
    }

    #[test]
    fn config_lookup_falls_back_to_t4() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("T4.yaml"), "gpu-memory-utilization: 0.85\n").unwrap();
        std::fs::write(dir.path().join("A100.yaml"), "gpu-memory-utilization: 0.95\n").unwrap();

        assert_eq!(
            config_path_for_gpu(dir.path(), "A100"),
            dir.path().join("A100.yaml")
        );
        assert_eq!(
            config_path_for_gpu(dir.path(), "B200"),
            dir.path().join("T4.yaml")
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
        // Multi-byte character straddling the limit is dropped whole.
        let s = "ab\u{00e9}cd";
        let t = truncate(s, 3);
        assert!(s.starts_with(&t));
    }
}
