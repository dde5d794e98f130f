//! Embedding pool: a single embedding model that stays resident for the process
//! lifetime unless an operator unloads it.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::ModelCatalog;
use crate::error::{Error, Result};
use crate::models::atomic_swap::SwapOutcome;
use crate::models::pool::{PoolCore, PoolStatus};
use crate::models::state::ModelState;
use crate::models::traits::InferenceEngine;
use crate::models::{ModelType, PoolKind};
use crate::resources::ResourceMonitor;

/// Result of an embedding request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EmbeddingOutcome {
    /// One vector per input text, in input order.
    Vectors(Vec<Vec<f32>>),
    /// Embeddings are switched off; not an error.
    Disabled,
}

impl EmbeddingOutcome {
    pub fn into_vectors(self) -> Option<Vec<Vec<f32>>> {
        match self {
            EmbeddingOutcome::Vectors(vectors) => Some(vectors),
            EmbeddingOutcome::Disabled => None,
        }
    }
}

#[derive(Debug)]
pub struct EmbeddingPool {
    core: PoolCore,
    enabled: bool,
}

impl EmbeddingPool {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        monitor: Arc<ResourceMonitor>,
        catalog: ModelCatalog,
        enabled: bool,
    ) -> Self {
        Self {
            core: PoolCore::new(PoolKind::Embedding, engine, monitor, catalog),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Loads the embedding model at startup. `None` when embeddings are disabled.
    pub async fn start(&self) -> Result<Option<SwapOutcome>> {
        if !self.enabled {
            info!("Embeddings disabled, embedding pool stays idle");
            return Ok(None);
        }
        self.core.ensure_loaded(ModelType::Embedding).await.map(Some)
    }

    pub async fn embed(&self, texts: &[String]) -> Result<EmbeddingOutcome> {
        if !self.enabled {
            return Ok(EmbeddingOutcome::Disabled);
        }
        if texts.is_empty() {
            return Err(Error::InvalidInput("embedding request has no texts".into()));
        }
        let instance = self
            .core
            .serving(ModelType::Embedding)
            .ok_or_else(|| Error::NotResident(format!("embedding pool is {:?}", self.core.state())))?;

        instance.embed(texts).await.map(EmbeddingOutcome::Vectors)
    }

    /// Brings the model back if an operator unloaded it or a load failed earlier.
    pub async fn ensure_loaded(&self) -> Result<SwapOutcome> {
        self.core.ensure_loaded(ModelType::Embedding).await
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

    pub fn state(&self) -> ModelState {
        self.core.state()
    }

    pub fn status(&self) -> PoolStatus {
        self.core.status()
    }
}
