// ================================================================================================
// ACCELERATOR BACKEND DETECTION AND MEMORY PROBES
// ================================================================================================
//
// Detects which accelerator backend is present and provides the memory readings the
// resource monitor relies on:
// - CUDA: `nvidia-smi` reports used/total memory of the first device
// - Metal / CPU: no portable query exists, so allocations are accounted by the engine
//
// ================================================================================================

use std::env;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuBackend {
    Cuda,
    Metal,
    Cpu,
}

impl GpuBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuBackend::Cuda => "CUDA",
            GpuBackend::Metal => "Metal",
            GpuBackend::Cpu => "CPU",
        }
    }
}

/// Auto-detect the best available accelerator backend.
pub fn detect_gpu_backend() -> GpuBackend {
    if let Ok(backend) = env::var("FORCE_GPU_BACKEND") {
        match backend.to_lowercase().as_str() {
            "cuda" => {
                info!("Forced CUDA backend via FORCE_GPU_BACKEND");
                return GpuBackend::Cuda;
            }
            "metal" => {
                info!("Forced Metal backend via FORCE_GPU_BACKEND");
                return GpuBackend::Metal;
            }
            "cpu" => {
                info!("Forced CPU backend via FORCE_GPU_BACKEND");
                return GpuBackend::Cpu;
            }
            _ => {
                warn!("Invalid FORCE_GPU_BACKEND value: {}, continuing auto-detection", backend);
            }
        }
    }

    if cfg!(feature = "cuda") && NvidiaSmiProbe::default().read().is_ok() {
        info!("NVIDIA GPU detected - using CUDA backend");
        return GpuBackend::Cuda;
    }

    if cfg!(all(feature = "metal", target_os = "macos")) {
        info!("macOS with Metal support - using Metal backend");
        return GpuBackend::Metal;
    }

    info!("No GPU detected - using CPU backend");
    GpuBackend::Cpu
}

/// One snapshot of accelerator memory, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl MemoryReading {
    pub fn free_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }
}

/// Source of accelerator memory readings. Must be cheap and must not block on
/// anything the pools hold.
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    fn read(&self) -> anyhow::Result<MemoryReading>;
}

/// Queries the first CUDA device through `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    device_index: u32,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self { device_index: 0 }
    }
}

impl NvidiaSmiProbe {
    fn parse(stdout: &str) -> anyhow::Result<MemoryReading> {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("nvidia-smi returned no rows"))?;

        let mut fields = line.split(',').map(str::trim);
        let used_mb = fields
            .next()
            .ok_or_else(|| anyhow!("missing memory.used column"))?
            .parse::<u64>()
            .context("memory.used is not an integer")?;
        let total_mb = fields
            .next()
            .ok_or_else(|| anyhow!("missing memory.total column"))?
            .parse::<u64>()
            .context("memory.total is not an integer")?;

        Ok(MemoryReading { used_mb, total_mb })
    }
}

impl MemoryProbe for NvidiaSmiProbe {
    fn read(&self) -> anyhow::Result<MemoryReading> {
        let output = Command::new("nvidia-smi")
            .arg("--query-gpu=memory.used,memory.total")
            .arg("--format=csv,noheader,nounits")
            .arg(format!("--id={}", self.device_index))
            .output()
            .context("failed to run nvidia-smi")?;

        if !output.status.success() {
            return Err(anyhow!("nvidia-smi exited with {}", output.status));
        }

        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Memory accounted by the engine itself: the engine adds a model's footprint on
/// load and subtracts it on unload. Used on backends without a query API and by
/// the simulated engine.
#[derive(Debug)]
pub struct AccountingProbe {
    total_mb: AtomicU64,
    used_mb: AtomicU64,
    unreachable: AtomicBool,
}

impl AccountingProbe {
    pub fn new(total_mb: u64) -> Self {
        Self {
            total_mb: AtomicU64::new(total_mb),
            used_mb: AtomicU64::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn allocate(&self, mb: u64) {
        self.used_mb.fetch_add(mb, Ordering::SeqCst);
    }

    pub fn release(&self, mb: u64) {
        let _ = self
            .used_mb
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| Some(used.saturating_sub(mb)));
    }

    pub fn used_mb(&self) -> u64 {
        self.used_mb.load(Ordering::SeqCst)
    }

    /// Makes every subsequent read fail, as if the device stopped answering.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl MemoryProbe for AccountingProbe {
    fn read(&self) -> anyhow::Result<MemoryReading> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("accounting probe marked unreachable"));
        }
        Ok(MemoryReading {
            used_mb: self.used_mb.load(Ordering::SeqCst),
            total_mb: self.total_mb.load(Ordering::SeqCst),
        })
    }
}
