//! GPU device probe.
//!
//! A small capability over NVML: device memory totals and the set of
//! GPU-resident compute processes. The rest of the daemon only ever talks to
//! the [`GpuProbe`] trait, so tests (and `--mock-gpu` runs on hosts without
//! NVIDIA drivers) can substitute [`StaticProbe`].

use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;

/// Memory totals for device 0, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// One GPU-resident compute process.
#[derive(Debug, Clone, Copy)]
pub struct GpuProcess {
    pub pid: u32,
    pub used_bytes: u64,
}

pub trait GpuProbe: Send + Sync {
    /// Memory totals for the primary device. Returns zeros when the query
    /// fails; telemetry degrades rather than erroring.
    fn memory(&self) -> DeviceMemory;

    /// Compute processes on the primary device with their memory footprint.
    fn compute_processes(&self) -> Vec<GpuProcess>;

    /// Number of devices on the host.
    fn device_count(&self) -> u32;

    /// Marketing name of the primary device, e.g. "NVIDIA A100-SXM4-80GB".
    fn device_name(&self) -> Option<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("NVML initialization failed: {0}")]
    Init(#[from] nvml_wrapper::error::NvmlError),

    #[error("no GPU devices found")]
    NoDevices,
}

/// NVML-backed probe. Initialization is fatal at startup; per-call failures
/// afterwards are logged and reported as empty results.
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    pub fn init() -> Result<Self, GpuError> {
        let nvml = Nvml::init()?;
        let count = nvml.device_count()?;
        if count == 0 {
            return Err(GpuError::NoDevices);
        }
        tracing::info!(devices = count, "NVML initialized");
        Ok(Self { nvml })
    }
}

impl GpuProbe for NvmlProbe {
    fn memory(&self) -> DeviceMemory {
        let info = self
            .nvml
            .device_by_index(0)
            .and_then(|device| device.memory_info());
        match info {
            Ok(mem) => DeviceMemory {
                total: mem.total,
                used: mem.used,
                free: mem.free,
            },
            Err(e) => {
                tracing::warn!(error = %e, "GPU memory query failed");
                DeviceMemory::default()
            }
        }
    }

    fn compute_processes(&self) -> Vec<GpuProcess> {
        let procs = self
            .nvml
            .device_by_index(0)
            .and_then(|device| device.running_compute_processes());
        match procs {
            Ok(procs) => procs
                .into_iter()
                .map(|p| GpuProcess {
                    pid: p.pid,
                    used_bytes: match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    },
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "GPU process query failed");
                Vec::new()
            }
        }
    }

    fn device_count(&self) -> u32 {
        self.nvml.device_count().unwrap_or(1).max(1)
    }

    fn device_name(&self) -> Option<String> {
        self.nvml
            .device_by_index(0)
            .and_then(|device| device.name())
            .ok()
    }
}

/// Fixed-answer probe for tests and GPU-less development hosts.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub memory: DeviceMemory,
    pub processes: Vec<GpuProcess>,
    pub devices: u32,
    pub name: Option<String>,
}

impl GpuProbe for StaticProbe {
    fn memory(&self) -> DeviceMemory {
        self.memory
    }

    fn compute_processes(&self) -> Vec<GpuProcess> {
        self.processes.clone()
    }

    fn device_count(&self) -> u32 {
        self.devices.max(1)
    }

    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }
}
