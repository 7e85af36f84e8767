//! Telemetry collection and aggregation.
//!
//! Two call shapes share the same plumbing: a single snapshot of device
//! memory plus per-model KV-cache state, and a windowed collection that
//! samples every 500 ms and reduces each metric to min/max/avg/p95/p99.
//!
//! Per-model VRAM attribution maps each GPU-resident process to a deployment
//! by reading the process's cgroup and matching the docker path segment
//! against the live container ids. Memory the attribution could not account
//! for is redistributed across models, proportionally to KV-cache use when
//! any model reports it.

use crate::docker::{live_vllm_containers, ContainerRuntime, LiveContainer};
use crate::gpu::{GpuProbe, GpuProcess};
use crate::registry::ModelRegistry;
use crate::scrape::{MetricsScraper, ModelBlockData, DEFAULT_BLOCK_SIZE};
use crate::stats::{aggregate, AggregatedStats};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::debug;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const MAX_SAMPLES: usize = 100;
pub const MIN_WINDOW_SECONDS: u64 = 1;
pub const MAX_WINDOW_SECONDS: u64 = 60;

/// Per-model share of device memory at one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModelVram {
    pub model_id: String,
    pub port: u16,
    pub allocated_vram_bytes: u64,
    pub used_kv_cache_bytes: u64,
}

/// Single-shot telemetry response.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedSnapshot {
    pub total_vram_bytes: u64,
    pub allocated_vram_bytes: u64,
    pub used_kv_cache_bytes: u64,
    pub prefix_cache_hit_rate: f64,
    pub allocated_blocks: u64,
    pub utilized_blocks: u64,
    pub models: Vec<ModelVram>,
}

/// Windowed telemetry response.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedSnapshot {
    pub total_vram_bytes: u64,
    pub window_seconds: u64,
    pub sample_count: usize,
    pub allocated_vram_bytes: AggregatedStats,
    pub used_kv_cache_bytes: AggregatedStats,
    pub prefix_cache_hit_rate: AggregatedStats,
    pub num_requests_running: AggregatedStats,
    pub num_requests_waiting: AggregatedStats,
    pub models: Vec<ModelVram>,
}

/// Shared telemetry context: the GPU probe, the runtime listing, the metrics
/// scraper, and the registry whose rings absorb samples.
pub struct Collector {
    pub probe: Arc<dyn GpuProbe>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub scraper: Arc<MetricsScraper>,
    pub registry: Arc<ModelRegistry>,
}

impl Collector {
    /// Scrape every running model in parallel. The fan-out never exceeds the
    /// deployed-model count and each scrape is individually bounded.
    pub async fn scrape_running_models(&self) -> Vec<ModelBlockData> {
        let live = match live_vllm_containers(self.runtime.as_ref()).await {
            Ok(live) => live,
            Err(e) => {
                debug!(error = %e, "runtime listing failed, skipping scrape");
                return Vec::new();
            }
        };
        self.scrape_models(&live).await
    }

    async fn scrape_models(&self, live: &[LiveContainer]) -> Vec<ModelBlockData> {
        let mut tasks = JoinSet::new();
        for container in live {
            let scraper = Arc::clone(&self.scraper);
            let model_id = container.model_id.clone();
            let port = container.port;
            tasks.spawn(async move { scraper.scrape(&model_id, port).await });
        }
        let mut out = Vec::with_capacity(live.len());
        while let Some(result) = tasks.join_next().await {
            if let Ok(data) = result {
                out.push(data);
            }
        }
        out
    }

    pub async fn detailed_snapshot(&self) -> DetailedSnapshot {
        self.snapshot_with_models().await.0
    }

    async fn snapshot_with_models(&self) -> (DetailedSnapshot, Vec<ModelBlockData>) {
        let memory = self.probe.memory();
        let processes = self.probe.compute_processes();
        let live = live_vllm_containers(self.runtime.as_ref())
            .await
            .unwrap_or_default();
        let models_data = self.scrape_models(&live).await;

        let cgroups = read_cgroups(&processes);
        let matched = attribute_processes(&processes, &cgroups, &live);

        let breakdown = build_vram_breakdown(&models_data, &matched, memory.used);

        let snapshot = DetailedSnapshot {
            total_vram_bytes: memory.total,
            allocated_vram_bytes: memory.used,
            used_kv_cache_bytes: breakdown.used_kv_cache_bytes,
            prefix_cache_hit_rate: breakdown.prefix_cache_hit_rate,
            allocated_blocks: breakdown.allocated_blocks,
            utilized_blocks: breakdown.utilized_blocks,
            models: breakdown.models,
        };
        (snapshot, models_data)
    }

    /// Sample over a window, clamped to [1, 60] seconds, at a 500 ms cadence
    /// and at most 100 samples per call.
    pub async fn collect(&self, window_seconds: u64) -> AggregatedSnapshot {
        let window = window_seconds.clamp(MIN_WINDOW_SECONDS, MAX_WINDOW_SECONDS);
        let end = Instant::now() + Duration::from_secs(window);

        let mut total_vram = 0u64;
        let mut allocated = Vec::new();
        let mut kv_cache = Vec::new();
        let mut prefix = Vec::new();
        let mut running = Vec::new();
        let mut waiting = Vec::new();

        while Instant::now() < end && allocated.len() < MAX_SAMPLES {
            let (snapshot, models_data) = self.snapshot_with_models().await;
            if total_vram == 0 {
                total_vram = snapshot.total_vram_bytes;
            }
            allocated.push(snapshot.allocated_vram_bytes as f64);
            kv_cache.push(snapshot.used_kv_cache_bytes as f64);
            prefix.push(snapshot.prefix_cache_hit_rate);

            let available = models_data.iter().filter(|m| m.available);
            let (mut run, mut wait) = (0u64, 0u64);
            for model in available {
                run += model.requests_running;
                wait += model.requests_waiting;
            }
            running.push(run as f64);
            waiting.push(wait as f64);

            if Instant::now() < end {
                tokio::time::sleep(SAMPLE_INTERVAL).await;
            }
        }
        let sample_count = allocated.len();

        // Final snapshot decides which models appear in the breakdown.
        let (final_snapshot, _) = self.snapshot_with_models().await;
        let models = final_snapshot
            .models
            .into_iter()
            .filter(|m| m.allocated_vram_bytes > 0)
            .collect();

        AggregatedSnapshot {
            total_vram_bytes: total_vram,
            window_seconds: window,
            sample_count,
            allocated_vram_bytes: aggregate(&allocated),
            used_kv_cache_bytes: aggregate(&kv_cache),
            prefix_cache_hit_rate: aggregate(&prefix),
            num_requests_running: aggregate(&running),
            num_requests_waiting: aggregate(&waiting),
            models,
        }
    }

    /// Push one VRAM percentage sample per registered deployment, attributed
    /// by the container's recorded host PID. Stale records are pruned first;
    /// a failed runtime listing skips the pass entirely rather than treating
    /// every record as stale.
    pub async fn sample_vram_rings(&self) {
        let live = match live_vllm_containers(self.runtime.as_ref()).await {
            Ok(live) => live,
            Err(e) => {
                debug!(error = %e, "runtime listing failed, skipping ring samples");
                return;
            }
        };
        let running: std::collections::HashSet<String> =
            live.iter().map(|c| c.container_name.clone()).collect();
        self.registry.prune_stale(&running);

        let memory = self.probe.memory();
        if memory.total == 0 {
            return;
        }
        let processes = self.probe.compute_processes();
        for record in self.registry.snapshot() {
            if record.process_id == 0 {
                continue;
            }
            let used: u64 = processes
                .iter()
                .filter(|p| p.pid == record.process_id)
                .map(|p| p.used_bytes)
                .sum();
            let percent = 100.0 * used as f64 / memory.total as f64;
            self.registry.record_sample(&record.container_name, percent);
        }
    }
}

struct VramBreakdown {
    models: Vec<ModelVram>,
    used_kv_cache_bytes: u64,
    prefix_cache_hit_rate: f64,
    allocated_blocks: u64,
    utilized_blocks: u64,
}

/// Build the per-model view out of scrape results and matched process
/// memory. The device-level `used` figure bounds the redistribution of
/// whatever the cgroup matching could not attribute.
fn build_vram_breakdown(
    models_data: &[ModelBlockData],
    matched: &HashMap<String, u64>,
    device_used: u64,
) -> VramBreakdown {
    let mut models = Vec::with_capacity(models_data.len());
    let mut total_kv = 0u64;
    let mut allocated_blocks = 0u64;
    let mut utilized_blocks = 0u64;

    for data in models_data {
        let mut entry = ModelVram {
            model_id: data.model_id.clone(),
            port: data.port,
            allocated_vram_bytes: 0,
            used_kv_cache_bytes: 0,
        };

        if data.available && data.num_gpu_blocks > 0 {
            let allocated = matched.get(&data.model_id).copied().unwrap_or(0);
            // Matched memory refines the block size reported in labels.
            let block_size = if allocated > 0 {
                allocated / data.num_gpu_blocks
            } else if data.block_size_bytes > 0 {
                data.block_size_bytes
            } else {
                DEFAULT_BLOCK_SIZE
            };
            let block_size = block_size.max(1);

            let utilized = ((data.num_gpu_blocks as f64 * data.kv_cache_usage).round() as u64)
                .min(data.num_gpu_blocks);
            let mut kv_bytes = (data.num_gpu_blocks as f64
                * block_size as f64
                * data.kv_cache_usage) as u64;
            if allocated > 0 {
                kv_bytes = kv_bytes.min(allocated);
            }

            entry.allocated_vram_bytes = allocated;
            entry.used_kv_cache_bytes = kv_bytes;
            total_kv += kv_bytes;
            allocated_blocks += data.num_gpu_blocks;
            utilized_blocks += utilized;
        }

        models.push(entry);
    }

    redistribute_unmatched(&mut models, device_used);

    // Redistribution only grows allocations, but KV use must never exceed
    // them in what we report.
    let mut total_kv_capped = 0u64;
    for model in &mut models {
        if model.allocated_vram_bytes > 0 {
            model.used_kv_cache_bytes =
                model.used_kv_cache_bytes.min(model.allocated_vram_bytes);
        }
        total_kv_capped += model.used_kv_cache_bytes;
    }
    if total_kv_capped < total_kv {
        total_kv = total_kv_capped;
    }

    let with_rate: Vec<f64> = models_data
        .iter()
        .filter(|m| m.available && m.prefix_cache_hit_rate > 0.0)
        .map(|m| m.prefix_cache_hit_rate)
        .collect();
    let prefix_cache_hit_rate = if with_rate.is_empty() {
        0.0
    } else {
        with_rate.iter().sum::<f64>() / with_rate.len() as f64
    };

    VramBreakdown {
        models,
        used_kv_cache_bytes: total_kv,
        prefix_cache_hit_rate,
        allocated_blocks,
        utilized_blocks,
    }
}

/// When matched attribution explains less than half of the device's used
/// memory, spread the remainder over the models: proportionally to KV-cache
/// bytes when any model reports usage, evenly otherwise.
fn redistribute_unmatched(models: &mut [ModelVram], device_used: u64) {
    if device_used == 0 || models.is_empty() {
        return;
    }
    let matched_total: u64 = models.iter().map(|m| m.allocated_vram_bytes).sum();
    if matched_total >= device_used / 2 {
        return;
    }
    let remainder = device_used - matched_total;
    let kv_total: u64 = models.iter().map(|m| m.used_kv_cache_bytes).sum();

    if kv_total > 0 {
        for model in models.iter_mut() {
            if model.used_kv_cache_bytes > 0 {
                let share = model.used_kv_cache_bytes as f64 / kv_total as f64;
                model.allocated_vram_bytes += (remainder as f64 * share) as u64;
            }
        }
    } else {
        let per_model = remainder / models.len() as u64;
        for model in models.iter_mut() {
            model.allocated_vram_bytes += per_model;
        }
    }
}

/// Cgroup file contents for each GPU-resident process, keyed by PID.
fn read_cgroups(processes: &[GpuProcess]) -> HashMap<u32, String> {
    let mut out = HashMap::with_capacity(processes.len());
    for process in processes {
        if let Ok(text) = std::fs::read_to_string(format!("/proc/{}/cgroup", process.pid)) {
            out.insert(process.pid, text);
        }
    }
    out
}

/// Sum matched process memory per model id.
fn attribute_processes(
    processes: &[GpuProcess],
    cgroups: &HashMap<u32, String>,
    live: &[LiveContainer],
) -> HashMap<String, u64> {
    let mut matched: HashMap<String, u64> = HashMap::new();
    for process in processes {
        let Some(text) = cgroups.get(&process.pid) else {
            continue;
        };
        let Some(cgroup_id) = container_id_from_cgroup(text) else {
            continue;
        };
        let owner = live.iter().find(|c| {
            c.container_id.starts_with(&cgroup_id) || cgroup_id.starts_with(&c.container_id)
        });
        if let Some(container) = owner {
            *matched.entry(container.model_id.clone()).or_default() += process.used_bytes;
        }
    }
    matched
}

/// First path segment under `/docker/` in a cgroup file.
fn container_id_from_cgroup(text: &str) -> Option<String> {
    for line in text.lines() {
        let Some(start) = line.find("/docker/") else {
            continue;
        };
        let rest = &line[start + "/docker/".len()..];
        let end = rest.find('/').unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
    }
    None
}
