pub mod atomic_swap;
pub mod circuit_breaker;
pub mod embedding_pool;
pub mod generation_pool;
pub mod instance;
pub mod pool;
pub mod simulated;
pub mod state;
pub mod traits;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use atomic_swap::{SwapKind, SwapMetrics, SwapOutcome};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState};
pub use embedding_pool::{EmbeddingOutcome, EmbeddingPool};
pub use generation_pool::GenerationPool;
pub use instance::{InstanceMetrics, InstanceSnapshot, ModelInstance};
pub use pool::PoolStatus;
pub use simulated::{EngineEvent, SimulatedEngine};
pub use state::ModelState;
pub use traits::{
    BoxedModel, ChunkSink, EngineError, GenerationParams, GenerationStats, InferenceEngine, ModelTrait,
};

/// The kinds of model the runtime serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Summary,
    Embedding,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [ModelType::Chat, ModelType::Summary, ModelType::Embedding];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Chat => "chat",
            ModelType::Summary => "summary",
            ModelType::Embedding => "embedding",
        }
    }

    /// The pool responsible for this model type.
    pub fn pool(self) -> PoolKind {
        match self {
            ModelType::Chat | ModelType::Summary => PoolKind::Generation,
            ModelType::Embedding => PoolKind::Embedding,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two pool specializations. Each holds at most one resident instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Generation,
    Embedding,
}

impl PoolKind {
    pub fn accepts(self, model_type: ModelType) -> bool {
        model_type.pool() == self
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Generation => f.write_str("generation"),
            PoolKind::Embedding => f.write_str("embedding"),
        }
    }
}
