//! In-memory deployment registry.
//!
//! One record per live container, keyed by container name, guarded by a
//! single mutex. Lock scopes are bounded to the critical section; iteration
//! happens over a copied snapshot, never under the lock across IO.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Ring capacity for per-model VRAM percentage samples.
pub const VRAM_SAMPLE_CAPACITY: usize = 100;

const NAME_PREFIX: &str = "vllm-";

/// Deterministic container name: `vllm-` plus the model id with every
/// non-alphanumeric character replaced by `-`.
pub fn container_name(model_id: &str) -> String {
    let mut name = String::with_capacity(NAME_PREFIX.len() + model_id.len());
    name.push_str(NAME_PREFIX);
    for c in model_id.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else {
            name.push('-');
        }
    }
    name
}

/// One live deployment.
#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    /// Canonical id as returned by the registry, not the raw request id.
    pub model_id: String,
    pub container_id: String,
    pub container_name: String,
    pub port: u16,
    pub gpu_type: String,
    /// Host PID of the container's main process; 0 while unknown.
    pub process_id: u32,
    /// Fraction of device memory the runtime may claim, in (0, 0.95].
    pub configured_budget: f64,
    vram_samples: VecDeque<f64>,
    pub peak_vram_percent: f64,
}

impl DeploymentRecord {
    pub fn new(
        model_id: impl Into<String>,
        container_id: impl Into<String>,
        port: u16,
        gpu_type: impl Into<String>,
        process_id: u32,
        configured_budget: f64,
    ) -> Self {
        let model_id = model_id.into();
        let container_name = container_name(&model_id);
        Self {
            model_id,
            container_id: container_id.into(),
            container_name,
            port,
            gpu_type: gpu_type.into(),
            process_id,
            configured_budget: clamp_budget(configured_budget),
            vram_samples: VecDeque::with_capacity(VRAM_SAMPLE_CAPACITY),
            peak_vram_percent: 0.0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.vram_samples.len()
    }

    /// Arithmetic mean of the ring, `None` when empty.
    pub fn mean_vram_percent(&self) -> Option<f64> {
        if self.vram_samples.is_empty() {
            return None;
        }
        Some(self.vram_samples.iter().sum::<f64>() / self.vram_samples.len() as f64)
    }

    fn push_sample(&mut self, percent: f64) {
        if self.vram_samples.len() == VRAM_SAMPLE_CAPACITY {
            self.vram_samples.pop_front();
        }
        self.vram_samples.push_back(percent);
        if percent > self.peak_vram_percent {
            self.peak_vram_percent = percent;
        }
    }

    #[cfg(test)]
    pub fn preload_samples(&mut self, samples: impl IntoIterator<Item = f64>) {
        for s in samples {
            self.push_sample(s);
        }
    }
}

/// Budget must stay in (0, 0.95]; out-of-range values fall back to the
/// runtime default of 0.95.
pub fn clamp_budget(budget: f64) -> f64 {
    if budget > 0.0 {
        budget.min(0.95)
    } else {
        0.95
    }
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    inner: Mutex<HashMap<String, DeploymentRecord>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any existing record for the same name.
    pub fn register(&self, record: DeploymentRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(record.container_name.clone(), record);
    }

    pub fn unregister(&self, container_name: &str) {
        self.inner.lock().unwrap().remove(container_name);
    }

    pub fn get(&self, container_name: &str) -> Option<DeploymentRecord> {
        self.inner.lock().unwrap().get(container_name).cloned()
    }

    /// Copy of all records for read-only iteration outside the lock.
    pub fn snapshot(&self) -> Vec<DeploymentRecord> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a VRAM percentage sample and update the running peak. Samples
    /// for unknown names are dropped silently; a sample racing a prune does
    /// not matter.
    pub fn record_sample(&self, container_name: &str, percent: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(container_name) {
            record.push_sample(percent);
        }
    }

    /// Drop every record whose name is not in the observed running set.
    pub fn prune_stale(&self, running: &HashSet<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|name, _| {
            let keep = running.contains(name);
            if !keep {
                tracing::debug!(container = %name, "pruning stale deployment record");
            }
            keep
        });
    }

    /// Ports of all live records.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.inner.lock().unwrap().values().map(|r| r.port).collect()
    }
}
