//! One loaded model plus its runtime metadata.

use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::models::state::ModelState;
use crate::models::traits::{BoxedModel, ChunkSink, GenerationParams, GenerationStats};
use crate::models::ModelType;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceMetrics {
    pub requests_served: u64,
    pub tokens_generated: u64,
    pub texts_embedded: u64,
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl InstanceMetrics {
    fn record(&mut self, latency_ms: u64) {
        self.requests_served += 1;
        self.last_used = Some(Utc::now());

        let alpha = 0.1;
        if self.requests_served == 1 {
            self.avg_latency_ms = latency_ms as f64;
        } else {
            self.avg_latency_ms = alpha * latency_ms as f64 + (1.0 - alpha) * self.avg_latency_ms;
        }
    }
}

/// Read-only view for status output.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: Uuid,
    pub model_type: ModelType,
    pub path: String,
    pub state: ModelState,
    pub memory_mb: u64,
    pub loaded_at: Option<DateTime<Utc>>,
    pub metrics: InstanceMetrics,
}

/// Owned by exactly one pool. The engine handle lives behind an async mutex: whoever
/// holds it is the one operation in flight against this instance, and teardown
/// takes it too, so teardown waits for in-flight work to finish.
pub struct ModelInstance {
    id: Uuid,
    config: ModelConfig,
    state: StdMutex<ModelState>,
    model: Mutex<Option<BoxedModel>>,
    memory_mb: StdMutex<u64>,
    loaded_at: StdMutex<Option<DateTime<Utc>>>,
    metrics: StdMutex<InstanceMetrics>,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModelInstance({}, {})", self.config.model_type, self.id)
    }
}

/// Puts a `Generating` instance back to `Loaded` if the generation future is
/// dropped mid-flight (caller timeout).
struct GeneratingGuard<'a> {
    instance: &'a ModelInstance,
    armed: bool,
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.instance.transition(ModelState::Loaded);
        }
    }
}

impl ModelInstance {
    /// New instance in `Loading`; the engine handle is attached once loading succeeds.
    pub fn loading(config: ModelConfig) -> Self {
        let mut state = ModelState::Idle;
        let _ = state.transition(ModelState::Loading);
        Self {
            id: Uuid::new_v4(),
            memory_mb: StdMutex::new(config.memory_mb),
            config,
            state: StdMutex::new(state),
            model: Mutex::new(None),
            loaded_at: StdMutex::new(None),
            metrics: StdMutex::new(InstanceMetrics::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_type(&self) -> ModelType {
        self.config.model_type
    }

    pub fn state(&self) -> ModelState {
        self.state.lock().map(|s| *s).unwrap_or(ModelState::Error)
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.lock().map(|m| *m).unwrap_or(self.config.memory_mb)
    }

    pub fn is_serving(&self) -> bool {
        self.state().is_serving()
    }

    pub(crate) fn transition(&self, next: ModelState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::InvalidTransition("instance state lock poisoned".into()))?;
        state.transition(next)
    }

    /// Forces `Error`; always valid from any state.
    pub(crate) fn mark_failed(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ModelState::Error;
        }
    }

    pub(crate) async fn attach(&self, model: BoxedModel) -> Result<()> {
        let measured = model.memory_mb();
        *self.model.lock().await = Some(model);
        if let Ok(mut memory) = self.memory_mb.lock() {
            *memory = measured;
        }
        if let Ok(mut loaded_at) = self.loaded_at.lock() {
            *loaded_at = Some(Utc::now());
        }
        self.transition(ModelState::Loaded)
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut ChunkSink,
    ) -> Result<GenerationStats> {
        let mut slot = self.model.lock().await;
        let model = slot
            .as_mut()
            .ok_or_else(|| Error::NotResident(format!("{} instance {} was torn down", self.model_type(), self.id)))?;

        self.transition(ModelState::Generating)?;
        let mut guard = GeneratingGuard {
            instance: self,
            armed: true,
        };

        let started = Instant::now();
        let result = model.generate(prompt, params, sink).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(stats) => {
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.record(latency_ms);
                    metrics.tokens_generated += stats.tokens_generated as u64;
                }
                debug!(instance_id = %self.id, tokens = stats.tokens_generated, latency_ms, "Generation finished");
                Ok(stats)
            }
            Err(e) if e.instance_unusable() => {
                guard.armed = false;
                self.mark_failed();
                error!(instance_id = %self.id, error = %e, "Engine reported instance unusable");
                Err(Error::GenerationFailure(e.to_string()))
            }
            Err(e) => {
                error!(instance_id = %self.id, error = %e, "Generation failed, instance stays loaded");
                Err(Error::GenerationFailure(e.to_string()))
            }
        }
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut slot = self.model.lock().await;
        let model = slot
            .as_mut()
            .ok_or_else(|| Error::NotResident(format!("embedding instance {} was torn down", self.id)))?;

        let started = Instant::now();
        match model.embed(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => {
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.record(started.elapsed().as_millis() as u64);
                    metrics.texts_embedded += texts.len() as u64;
                }
                Ok(vectors)
            }
            Ok(vectors) => Err(Error::EmbeddingFailure(format!(
                "engine returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            ))),
            Err(e) => {
                if e.instance_unusable() {
                    self.mark_failed();
                }
                Err(Error::EmbeddingFailure(e.to_string()))
            }
        }
    }

    /// Waits for in-flight work, then releases the engine handle and its memory.
    /// Returns the memory that was held.
    pub(crate) async fn teardown(&self) -> Result<u64> {
        let mut slot = self.model.lock().await;
        let Some(model) = slot.take() else {
            return Ok(0);
        };
        let memory_mb = self.memory_mb();

        if self.state() != ModelState::Error {
            self.transition(ModelState::Unloading)?;
        }

        let result = model.unload().await;
        self.transition(ModelState::Idle)?;

        match result {
            Ok(()) => {
                info!(instance_id = %self.id, model_type = %self.model_type(), memory_mb, "Instance unloaded");
                Ok(memory_mb)
            }
            Err(e) => Err(Error::LoadFailure(format!("unload of {} failed: {e}", self.id))),
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            model_type: self.model_type(),
            path: self.config.path.clone(),
            state: self.state(),
            memory_mb: self.memory_mb(),
            loaded_at: self.loaded_at.lock().ok().and_then(|l| *l),
            metrics: self.metrics.lock().map(|m| m.clone()).unwrap_or_default(),
        }
    }
}
