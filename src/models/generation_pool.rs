// ARCHITECTURE: Generation Pool - One Resident Text Generator
//
// Holds at most one of {chat, summary}. Switching between them goes through the
// shared swap machinery; at most one generation runs at a time across the pool.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::ModelCatalog;
use crate::error::{Error, Result};
use crate::models::atomic_swap::SwapOutcome;
use crate::models::pool::{PoolCore, PoolStatus};
use crate::models::state::ModelState;
use crate::models::traits::{ChunkSink, GenerationParams, GenerationStats, InferenceEngine};
use crate::models::{ModelType, PoolKind};
use crate::resources::ResourceMonitor;

#[derive(Debug)]
pub struct GenerationPool {
    core: PoolCore,
    in_flight: Mutex<()>,
}

impl GenerationPool {
    pub fn new(engine: Arc<dyn InferenceEngine>, monitor: Arc<ResourceMonitor>, catalog: ModelCatalog) -> Self {
        Self {
            core: PoolCore::new(PoolKind::Generation, engine, monitor, catalog),
            in_flight: Mutex::new(()),
        }
    }

    pub async fn ensure_loaded(&self, model_type: ModelType) -> Result<SwapOutcome> {
        self.core.ensure_loaded(model_type).await
    }

    pub async fn preload(&self, model_type: ModelType) -> Result<bool> {
        self.core.preload(model_type).await
    }

    /// Streams one generation into `sink` on the resident instance, which must be
    /// `model_type`. Returns the serving instance and engine stats.
    pub async fn generate(
        &self,
        model_type: ModelType,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut ChunkSink,
    ) -> Result<(Uuid, GenerationStats)> {
        let _in_flight = self.in_flight.lock().await;
        let instance = self.core.serving(model_type).ok_or_else(|| {
            Error::NotResident(format!(
                "{model_type} requested but generation pool holds {:?}",
                self.core.resident_type()
            ))
        })?;

        debug!(instance_id = %instance.id(), %model_type, "Dispatching generation");
        let stats = instance.generate(prompt, params, sink).await?;
        Ok((instance.id(), stats))
    }

    pub async fn force_unload(&self) -> Option<ModelType> {
        self.core.unload_all().await
    }

    pub async fn force_reload(&self, model_type: ModelType) -> Result<SwapOutcome> {
        self.core.reload(model_type).await
    }

    pub fn reset(&self) -> bool {
        self.core.reset()
    }

    pub fn resident_type(&self) -> Option<ModelType> {
        self.core.resident_type()
    }

    pub fn standby_type(&self) -> Option<ModelType> {
        self.core.standby_type()
    }

    pub fn state(&self) -> ModelState {
        self.core.state()
    }

    pub fn status(&self) -> PoolStatus {
        self.core.status()
    }
}
