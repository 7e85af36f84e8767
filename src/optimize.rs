//! Right-sizing reconciliation.
//!
//! A model whose mean VRAM use over the ring sits well below its configured
//! budget is holding reservation headroom the device could reclaim. Such
//! models are restarted with the budget rewritten down to their observed
//! peak, floored at 10% and capped at 95%.

use crate::aggregate::Collector;
use crate::deploy::{config_path_for_gpu, DeployRequest, Deployer};
use crate::docker::live_vllm_containers;
use crate::registry::DeploymentRecord;
use metrics::counter;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Minimum ring occupancy before a model is considered.
const MIN_SAMPLES: usize = 10;
/// Restart when the mean sits below this fraction of the budget.
const HEADROOM_FACTOR: f64 = 0.7;

const MIN_BUDGET: f64 = 0.1;
const MAX_BUDGET: f64 = 0.95;

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeOutcome {
    pub optimized: bool,
    pub restarted_models: Vec<String>,
    pub message: String,
}

/// True when the record's history shows sustained under-use of its budget.
pub fn needs_restart(record: &DeploymentRecord) -> bool {
    if record.sample_count() < MIN_SAMPLES {
        return false;
    }
    let Some(mean) = record.mean_vram_percent() else {
        return false;
    };
    let threshold = record.configured_budget * 100.0 * HEADROOM_FACTOR;
    mean < threshold && record.peak_vram_percent > 0.0
}

/// Budget for the restarted deployment: the observed peak, clamped.
pub fn restart_budget(peak_vram_percent: f64) -> f64 {
    (peak_vram_percent / 100.0).clamp(MIN_BUDGET, MAX_BUDGET)
}

pub async fn optimize(deployer: &Deployer, collector: &Collector) -> OptimizeOutcome {
    // Work from a freshly pruned registry.
    if let Ok(live) = live_vllm_containers(collector.runtime.as_ref()).await {
        let running: HashSet<String> = live.iter().map(|c| c.container_name.clone()).collect();
        collector.registry.prune_stale(&running);
    }

    let candidates: Vec<DeploymentRecord> = collector
        .registry
        .snapshot()
        .into_iter()
        .filter(needs_restart)
        .collect();

    if candidates.is_empty() {
        return OptimizeOutcome {
            optimized: false,
            restarted_models: Vec::new(),
            message: "No models need optimization".to_string(),
        };
    }

    let mut restarted = Vec::new();
    for record in candidates {
        let budget = restart_budget(record.peak_vram_percent);
        info!(
            model = %record.model_id,
            mean = record.mean_vram_percent().unwrap_or(0.0),
            peak = record.peak_vram_percent,
            configured = record.configured_budget,
            new_budget = budget,
            "right-sizing model"
        );

        deployer.spindown(&record.container_name).await;

        let base_config = config_path_for_gpu(&deployer.config_dir, &record.gpu_type);
        let temp_config =
            std::env::temp_dir().join(format!("optimized_{}.yaml", record.container_name));
        if let Err(e) = rewrite_budget_config(&base_config, &temp_config, budget) {
            warn!(model = %record.model_id, error = %e, "config rewrite failed, skipping restart");
            continue;
        }

        let outcome = deployer
            .deploy(DeployRequest {
                model_id: record.model_id.clone(),
                hf_token: None,
                port: 0,
                gpu_type: Some(record.gpu_type.clone()),
                config_path: Some(temp_config),
            })
            .await;

        if outcome.success {
            counter!("gpuplane_optimize_restarts_total").increment(1);
            restarted.push(record.container_name);
        } else {
            warn!(model = %record.model_id, message = %outcome.message, "right-sizing restart failed");
        }
    }

    OptimizeOutcome {
        optimized: true,
        message: format!("Optimized {} model(s)", restarted.len()),
        restarted_models: restarted,
    }
}

/// Copy a config with `gpu-memory-utilization` overridden.
pub fn rewrite_budget_config(src: &Path, dst: &Path, budget: f64) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(src)?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&text)?;
    if let Some(mapping) = doc.as_mapping_mut() {
        mapping.insert(
            serde_yaml::Value::String("gpu-memory-utilization".to_string()),
            serde_yaml::Value::Number(serde_yaml::Number::from(budget)),
        );
    }
    std::fs::write(dst, serde_yaml::to_string(&doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::budget_from_config;

    fn record_with_samples(samples: &[f64], budget: f64) -> DeploymentRecord {
        let mut record = DeploymentRecord::new("org/model", "0123456789ab", 8000, "A100", 1, budget);
        record.preload_samples(samples.iter().copied());
        record
    }

    #[test]
    fn underused_model_is_selected() {
        // 40 samples of 30% against a 0.95 budget: threshold 66.5.
        let record = record_with_samples(&[30.0; 40], 0.95);
        assert!(needs_restart(&record));
    }

    #[test]
    fn short_history_is_not_selected() {
        let record = record_with_samples(&[5.0; 9], 0.95);
        assert!(!needs_restart(&record));
    }

    #[test]
    fn busy_model_is_not_selected() {
        let record = record_with_samples(&[90.0; 40], 0.95);
        assert!(!needs_restart(&record));
    }

    #[test]
    fn zero_peak_is_not_selected() {
        let record = record_with_samples(&[0.0; 40], 0.95);
        assert!(!needs_restart(&record));
    }

    #[test]
    fn restart_budget_clamps_to_operational_range() {
        assert_eq!(restart_budget(30.0), 0.3);
        assert_eq!(restart_budget(2.0), 0.1);
        assert_eq!(restart_budget(99.0), 0.95);
    }

    #[test]
    fn rewrite_overrides_utilization_and_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.yaml");
        let dst = dir.path().join("dst.yaml");
        std::fs::write(&src, "gpu-memory-utilization: 0.95\nmax-model-len: 4096\n").unwrap();

        rewrite_budget_config(&src, &dst, 0.3).unwrap();

        assert!((budget_from_config(&dst) - 0.3).abs() < 1e-9);
        let text = std::fs::read_to_string(&dst).unwrap();
        assert!(text.contains("max-model-len"));
    }
}
