// ARCHITECTURE: Inference Engine Contract
//
// The tensor kernel is an external collaborator. The scheduling core drives it only
// through this load / generate / embed / unload contract:
// - `InferenceEngine::load` turns a `ModelConfig` into a loaded model
// - `ModelTrait` is one loaded model; generation pushes chunks into a `ChunkSink`
// - `ModelTrait::unload` consumes the model and releases its memory immediately

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

use crate::config::ModelConfig;
use crate::models::ModelType;
use crate::scheduler::request::{GenerationChunk, GenerationEvent};

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
    /// Caller-side bound on in-flight generation time. Exceeding it closes the
    /// stream but leaves the model loaded.
    pub max_generation_ms: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
            max_generation_ms: None,
        }
    }
}

/// What the engine reports once a generation finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub tokens_generated: usize,
}

/// Faults reported by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine rejected input: {0}")]
    Rejected(String),

    #[error("engine fault: {0}")]
    Fault(String),

    /// The instance cannot serve anything else and must be torn down.
    #[error("instance unusable: {0}")]
    Unusable(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl EngineError {
    pub fn instance_unusable(&self) -> bool {
        matches!(self, EngineError::Unusable(_))
    }
}

/// Destination for generated text. Backed by the caller's bounded stream channel,
/// so a slow reader back-pressures the engine. With a stall grace set, a reader
/// that leaves the channel full for longer than the grace is treated as gone.
#[derive(Debug)]
pub struct ChunkSink {
    tx: mpsc::Sender<GenerationEvent>,
    emitted: usize,
    stall_grace: Option<Duration>,
    stalled: Arc<AtomicBool>,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<GenerationEvent>) -> Self {
        Self {
            tx,
            emitted: 0,
            stall_grace: None,
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gives up on a full channel after `grace`, raising `stalled`.
    pub fn with_stall_guard(mut self, grace: Duration, stalled: Arc<AtomicBool>) -> Self {
        self.stall_grace = Some(grace);
        self.stalled = stalled;
        self
    }

    /// Delivers one chunk. Returns `false` once the caller has dropped or stopped
    /// reading its stream; the engine should stop generating at that point.
    pub async fn emit(&mut self, text: impl Into<String>) -> bool {
        if self.stalled.load(Ordering::SeqCst) {
            return false;
        }
        let event = GenerationEvent::Chunk(GenerationChunk {
            index: self.emitted,
            text: text.into(),
        });

        let delivered = match self.stall_grace {
            None => self.tx.send(event).await.is_ok(),
            Some(grace) => match self.tx.send_timeout(event, grace).await {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Stream left unread, cancelling generation");
                    self.stalled.store(true, Ordering::SeqCst);
                    false
                }
                Err(SendTimeoutError::Closed(_)) => false,
            },
        };
        if delivered {
            self.emitted += 1;
        }
        delivered
    }
}

/// One loaded model.
#[async_trait]
pub trait ModelTrait: Send + Sync + Debug {
    fn model_type(&self) -> ModelType;

    fn model_name(&self) -> &str;

    /// Accelerator memory actually held by this instance, in MB.
    fn memory_mb(&self) -> u64;

    async fn generate(
        &mut self,
        _prompt: &str,
        _params: &GenerationParams,
        _sink: &mut ChunkSink,
    ) -> Result<GenerationStats, EngineError> {
        Err(EngineError::Unsupported(format!("{} cannot generate", self.model_name())))
    }

    /// Must return exactly one vector per input text, in input order.
    async fn embed(&mut self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Err(EngineError::Unsupported(format!("{} cannot embed", self.model_name())))
    }

    /// Releases the instance's accelerator memory before returning.
    async fn unload(self: Box<Self>) -> Result<(), EngineError>;
}

pub type BoxedModel = Box<dyn ModelTrait>;

/// Factory for loaded models.
#[async_trait]
pub trait InferenceEngine: Send + Sync + Debug {
    async fn load(&self, config: &ModelConfig) -> Result<BoxedModel, EngineError>;
}
