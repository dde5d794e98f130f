//! Resource Monitor: accelerator memory readings and footprint prediction.
//!
//! The monitor is the only gate deciding between an overlapped swap (load the new
//! model next to the old one) and a sequential swap (unload first). It never takes
//! an async lock and never calls into a pool, so the pools can consult it while
//! holding their own locks.

pub mod gpu;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{MemoryConfig, ModelConfig};
use crate::error::{Error, Result};
use crate::models::ModelType;

pub use gpu::{detect_gpu_backend, AccountingProbe, GpuBackend, MemoryProbe, MemoryReading, NvidiaSmiProbe};

/// How a pool replaces its resident model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwapStrategy {
    /// Load the new instance while the old one keeps serving, then swap pointers.
    Overlapped,
    /// Tear the old instance down completely, then load the new one.
    Sequential,
}

/// `current_usage + candidate_footprint + safety_margin <= total_capacity`
pub fn can_coexist(current_usage: u64, candidate_footprint: u64, safety_margin: u64, total_capacity: u64) -> bool {
    current_usage
        .saturating_add(candidate_footprint)
        .saturating_add(safety_margin)
        <= total_capacity
}

#[derive(Debug)]
pub struct ResourceMonitor {
    probe: Arc<dyn MemoryProbe>,
    ceiling_mb: u64,
    safety_margin_mb: u64,
    measured: RwLock<HashMap<ModelType, u64>>,
    /// Footprint of every live instance across all pools, by instance id.
    held: RwLock<HashMap<Uuid, u64>>,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: &MemoryConfig) -> Self {
        Self {
            probe,
            ceiling_mb: config.ceiling_mb,
            safety_margin_mb: config.safety_margin_mb,
            measured: RwLock::new(HashMap::new()),
            held: RwLock::new(HashMap::new()),
        }
    }

    /// Current usage with capacity clamped to the configured ceiling.
    /// `None` means the probe could not be read; callers must take the conservative path.
    pub fn reading(&self) -> Option<MemoryReading> {
        match self.probe.read() {
            Ok(reading) => Some(MemoryReading {
                used_mb: reading.used_mb,
                total_mb: reading.total_mb.min(self.ceiling_mb),
            }),
            Err(e) => {
                warn!(error = %e, "Memory probe unreadable, assuming worst case");
                None
            }
        }
    }

    /// Larger of the configured estimate and the last footprint measured for the type.
    pub fn predict_footprint(&self, config: &ModelConfig) -> u64 {
        let measured = self
            .measured
            .read()
            .map(|m| m.get(&config.model_type).copied())
            .unwrap_or(None);
        measured.map_or(config.memory_mb, |mb| mb.max(config.memory_mb))
    }

    pub fn record_footprint(&self, model_type: ModelType, memory_mb: u64) {
        if let Ok(mut measured) = self.measured.write() {
            measured.insert(model_type, memory_mb);
        }
    }

    /// Registers a loaded instance so projections survive an unreadable probe.
    pub fn hold(&self, instance_id: Uuid, memory_mb: u64) {
        if let Ok(mut held) = self.held.write() {
            held.insert(instance_id, memory_mb);
        }
    }

    pub fn release(&self, instance_id: Uuid) {
        if let Ok(mut held) = self.held.write() {
            held.remove(&instance_id);
        }
    }

    /// Sum of the footprints of every instance still held by a pool.
    pub fn held_mb(&self) -> u64 {
        self.held
            .read()
            .map(|h| h.values().fold(0u64, |sum, mb| sum.saturating_add(*mb)))
            .unwrap_or(self.ceiling_mb)
    }

    /// True only if the candidate fits next to everything currently allocated.
    pub fn fits_alongside(&self, candidate: &ModelConfig) -> bool {
        let footprint = self.predict_footprint(candidate);
        match self.reading() {
            Some(reading) => can_coexist(reading.used_mb, footprint, self.safety_margin_mb, reading.total_mb),
            None => false,
        }
    }

    pub fn plan_swap(&self, candidate: &ModelConfig) -> SwapStrategy {
        let strategy = if self.fits_alongside(candidate) {
            SwapStrategy::Overlapped
        } else {
            SwapStrategy::Sequential
        };
        debug!(model_type = %candidate.model_type, ?strategy, "Swap planned");
        strategy
    }

    /// Checks that the candidate fits once `released_mb` has been freed. Run before
    /// tearing anything down so a hopeless swap leaves the resident model alone.
    pub fn ensure_fits_after_release(&self, candidate: &ModelConfig, released_mb: u64) -> Result<()> {
        let footprint = self.predict_footprint(candidate);
        let (projected, total) = match self.reading() {
            Some(reading) => (reading.used_mb.saturating_sub(released_mb), reading.total_mb),
            // project from what the pools still hold
            None => (self.held_mb().saturating_sub(released_mb), self.ceiling_mb),
        };

        if can_coexist(projected, footprint, self.safety_margin_mb, total) {
            Ok(())
        } else {
            Err(Error::InsufficientResources(format!(
                "{} needs {}MB + {}MB margin, {}MB of {}MB would remain in use",
                candidate.model_type, footprint, self.safety_margin_mb, projected, total
            )))
        }
    }
}
