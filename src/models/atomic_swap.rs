// ARCHITECTURE: Atomic Model Swap - Swap Reporting and Metrics
//
// The resident instance of a pool is an `Arc` behind a pointer that is only ever
// replaced with a compare-and-set against the instance the swap started from:
// - OVERLAPPED: the new instance loads while the old one keeps serving; the pointer
//   flips once loading finishes, then the old instance is torn down as soon as its
//   in-flight work completes.
// - SEQUENTIAL: the pointer is cleared, the old instance is torn down, then the new
//   instance loads. Callers observe no resident model during the gap.
// - PROMOTED STANDBY: a preloaded instance becomes resident by pointer flip alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::ModelType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwapKind {
    /// The requested model was already resident; nothing happened.
    AlreadyResident,
    /// Nothing was resident before.
    ColdLoad,
    PromotedStandby,
    Overlapped,
    Sequential,
}

/// Report of one `ensure_loaded` / reload.
#[derive(Debug, Clone, Serialize)]
pub struct SwapOutcome {
    pub kind: SwapKind,
    pub previous: Option<ModelType>,
    pub current: ModelType,
    pub instance_id: Uuid,
    pub duration_ms: u64,
}

impl SwapOutcome {
    pub fn performed_load(&self) -> bool {
        matches!(self.kind, SwapKind::ColdLoad | SwapKind::Overlapped | SwapKind::Sequential)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapMetrics {
    pub total_swaps: u64,
    pub overlapped_swaps: u64,
    pub sequential_swaps: u64,
    pub promoted_standbys: u64,
    pub cold_loads: u64,
    pub loads: u64,
    pub unloads: u64,
    pub failed_loads: u64,
    pub average_swap_time_ms: f64,
    pub last_swap_time: Option<DateTime<Utc>>,
}

impl SwapMetrics {
    pub fn record(&mut self, outcome: &SwapOutcome) {
        match outcome.kind {
            SwapKind::AlreadyResident => return,
            SwapKind::ColdLoad => self.cold_loads += 1,
            SwapKind::PromotedStandby => self.promoted_standbys += 1,
            SwapKind::Overlapped => self.overlapped_swaps += 1,
            SwapKind::Sequential => self.sequential_swaps += 1,
        }
        self.total_swaps += 1;
        self.last_swap_time = Some(Utc::now());

        // Rolling average of swap time
        let alpha = 0.1;
        let duration = outcome.duration_ms as f64;
        if self.total_swaps == 1 {
            self.average_swap_time_ms = duration;
        } else {
            self.average_swap_time_ms = alpha * duration + (1.0 - alpha) * self.average_swap_time_ms;
        }
    }
}

/// Tracks one swap operation for logging.
#[derive(Debug, Clone)]
pub struct SwapContext {
    pub operation_id: Uuid,
    pub target: ModelType,
    pub reason: &'static str,
    pub started_at: tokio::time::Instant,
}

impl SwapContext {
    pub fn new(target: ModelType, reason: &'static str) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            target,
            reason,
            started_at: tokio::time::Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn finish(&self, kind: SwapKind, previous: Option<ModelType>, instance_id: Uuid) -> SwapOutcome {
        SwapOutcome {
            kind,
            previous,
            current: self.target,
            instance_id,
            duration_ms: self.duration().as_millis() as u64,
        }
    }
}
