pub mod batching;
pub mod config;
pub mod error;
pub mod models;
pub mod resources;
pub mod scheduler;

pub use config::{ModelCatalog, ModelConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use models::{EmbeddingOutcome, ModelState, ModelType, PoolKind};
pub use scheduler::request::{CallerClass, GenerationStream};
pub use scheduler::{RequestDistributor, RequestQueueManager, SchedulerStatus};
