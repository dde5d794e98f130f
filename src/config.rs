use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::batching::BatchConfig;
use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreakerConfig;
use crate::models::ModelType;
use crate::scheduler::predictor::PredictorConfig;
use crate::scheduler::request::CallerClass;

/// Static descriptor of one model the engine can load. Never mutated after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub path: String,
    pub context_length: usize,
    pub memory_mb: u64,
    /// Engine-specific tuning, passed through untouched.
    pub params: BTreeMap<String, String>,
}

impl ModelConfig {
    pub fn new(model_type: ModelType, path: impl Into<String>, memory_mb: u64) -> Self {
        Self {
            model_type,
            path: path.into(),
            context_length: 4096,
            memory_mb,
            params: BTreeMap::new(),
        }
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    fn from_env(model_type: ModelType, default: ModelConfig) -> Result<Self> {
        let prefix = match model_type {
            ModelType::Chat => "CHAT_MODEL",
            ModelType::Summary => "SUMMARY_MODEL",
            ModelType::Embedding => "EMBEDDING_MODEL",
        };

        let params = match env::var(format!("{prefix}_PARAMS")) {
            Ok(raw) => parse_params(&raw)?,
            Err(_) => default.params,
        };

        Ok(Self {
            model_type,
            path: env::var(format!("{prefix}_PATH")).unwrap_or(default.path),
            context_length: env_or(&format!("{prefix}_CONTEXT_LENGTH"), default.context_length)?,
            memory_mb: env_or(&format!("{prefix}_MEMORY_MB"), default.memory_mb)?,
            params,
        })
    }
}

/// Every model type the pools may load, keyed by type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    models: BTreeMap<ModelType, ModelConfig>,
}

impl ModelCatalog {
    pub fn new(configs: impl IntoIterator<Item = ModelConfig>) -> Self {
        Self {
            models: configs.into_iter().map(|c| (c.model_type, c)).collect(),
        }
    }

    pub fn get(&self, model_type: ModelType) -> Option<&ModelConfig> {
        self.models.get(&model_type)
    }

    pub fn require(&self, model_type: ModelType) -> Result<&ModelConfig> {
        self.get(model_type)
            .ok_or_else(|| Error::InvalidInput(format!("no model configured for {model_type}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }
}

/// Memory ceiling and reserved headroom, both in MB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub ceiling_mb: u64,
    pub safety_margin_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_mb: 24 * 1024,
            safety_margin_mb: 1024,
        }
    }
}

/// Admission policy for one caller class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallerPolicy {
    pub default_priority: u8,
    pub min_priority: u8,
    pub max_priority: u8,
    pub timeout_ms: u64,
    /// Largest timeout a caller may ask for.
    pub max_timeout_ms: u64,
}

impl CallerPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn allows(&self, priority: u8) -> bool {
        (self.min_priority..=self.max_priority).contains(&priority)
    }

    fn from_env(prefix: &str, default: CallerPolicy) -> Result<Self> {
        Ok(Self {
            default_priority: env_or(&format!("{prefix}_DEFAULT_PRIORITY"), default.default_priority)?,
            min_priority: env_or(&format!("{prefix}_MIN_PRIORITY"), default.min_priority)?,
            max_priority: env_or(&format!("{prefix}_MAX_PRIORITY"), default.max_priority)?,
            timeout_ms: env_or(&format!("{prefix}_TIMEOUT_MS"), default.timeout_ms)?,
            max_timeout_ms: env_or(&format!("{prefix}_MAX_TIMEOUT_MS"), default.max_timeout_ms)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerPolicies {
    pub chat: CallerPolicy,
    pub summary: CallerPolicy,
    pub npc_embedding: CallerPolicy,
}

impl CallerPolicies {
    pub fn for_class(&self, class: CallerClass) -> &CallerPolicy {
        match class {
            CallerClass::Chat => &self.chat,
            CallerClass::Summary => &self.summary,
            CallerClass::NpcEmbedding => &self.npc_embedding,
        }
    }
}

impl Default for CallerPolicies {
    fn default() -> Self {
        Self {
            chat: CallerPolicy {
                default_priority: 1,
                min_priority: 0,
                max_priority: 3,
                timeout_ms: 30_000,
                max_timeout_ms: 120_000,
            },
            npc_embedding: CallerPolicy {
                default_priority: 5,
                min_priority: 3,
                max_priority: 7,
                timeout_ms: 10_000,
                max_timeout_ms: 60_000,
            },
            summary: CallerPolicy {
                default_priority: 8,
                min_priority: 6,
                max_priority: 10,
                timeout_ms: 300_000,
                max_timeout_ms: 1_800_000,
            },
        }
    }
}

/// Top-level configuration for the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub memory: MemoryConfig,
    pub batching: BatchConfig,
    pub breaker: CircuitBreakerConfig,
    pub predictor: PredictorConfig,
    pub callers: CallerPolicies,
    pub models: ModelCatalog,
    pub embeddings_enabled: bool,
    /// Chunks buffered per generation stream before the engine is back-pressured.
    pub stream_buffer: usize,
    /// How long a full stream may go unread before the generation is cancelled.
    pub stream_stall_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            batching: BatchConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            predictor: PredictorConfig::default(),
            callers: CallerPolicies::default(),
            models: default_catalog(),
            embeddings_enabled: true,
            stream_buffer: 64,
            stream_stall_ms: 5_000,
        }
    }
}

fn default_catalog() -> ModelCatalog {
    ModelCatalog::new([
        ModelConfig::new(ModelType::Chat, "./models/chat.gguf", 18 * 1024).with_context_length(8192),
        ModelConfig::new(ModelType::Summary, "./models/summary.gguf", 8 * 1024).with_context_length(16384),
        ModelConfig::new(ModelType::Embedding, "./models/embedding.gguf", 512).with_context_length(512),
    ])
}

impl SchedulerConfig {
    pub fn stream_stall_grace(&self) -> Duration {
        Duration::from_millis(self.stream_stall_ms)
    }

    /// Reads every setting from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut models = Vec::new();
        for model_type in ModelType::ALL {
            let fallback = defaults
                .models
                .get(model_type)
                .cloned()
                .unwrap_or_else(|| ModelConfig::new(model_type, "", 0));
            models.push(ModelConfig::from_env(model_type, fallback)?);
        }

        let config = Self {
            memory: MemoryConfig {
                ceiling_mb: env_or("GPU_MEMORY_CEILING_MB", defaults.memory.ceiling_mb)?,
                safety_margin_mb: env_or("GPU_SAFETY_MARGIN_MB", defaults.memory.safety_margin_mb)?,
            },
            batching: BatchConfig {
                max_batch_size: env_or("EMBED_BATCH_MAX_SIZE", defaults.batching.max_batch_size)?,
                batch_window_ms: env_or("EMBED_BATCH_WINDOW_MS", defaults.batching.batch_window_ms)?,
                max_queue_size: env_or("QUEUE_MAX_SIZE", defaults.batching.max_queue_size)?,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", defaults.breaker.failure_threshold)?,
                cooldown_ms: env_or("BREAKER_COOLDOWN_MS", defaults.breaker.cooldown_ms)?,
            },
            predictor: PredictorConfig {
                interval_secs: env_or("PREDICTOR_INTERVAL_SECS", defaults.predictor.interval_secs)?,
                window_secs: env_or("PREDICTOR_WINDOW_SECS", defaults.predictor.window_secs)?,
                max_samples: env_or("PREDICTOR_MAX_SAMPLES", defaults.predictor.max_samples)?,
                low_load_threshold: env_or(
                    "PREDICTOR_LOW_LOAD_THRESHOLD",
                    defaults.predictor.low_load_threshold,
                )?,
            },
            callers: CallerPolicies {
                chat: CallerPolicy::from_env("CHAT", defaults.callers.chat)?,
                summary: CallerPolicy::from_env("SUMMARY", defaults.callers.summary)?,
                npc_embedding: CallerPolicy::from_env("NPC_EMBEDDING", defaults.callers.npc_embedding)?,
            },
            models: ModelCatalog::new(models),
            embeddings_enabled: env_or("EMBEDDINGS_ENABLED", defaults.embeddings_enabled)?,
            stream_buffer: env_or("STREAM_BUFFER", defaults.stream_buffer)?,
            stream_stall_ms: env_or("STREAM_STALL_MS", defaults.stream_stall_ms)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.safety_margin_mb >= self.memory.ceiling_mb {
            return Err(Error::Config(format!(
                "safety margin {}MB must be below the memory ceiling {}MB",
                self.memory.safety_margin_mb, self.memory.ceiling_mb
            )));
        }
        if self.batching.max_batch_size == 0 {
            return Err(Error::Config("embedding batch size must be at least 1".into()));
        }
        if self.batching.batch_window_ms == 0 {
            return Err(Error::Config("embedding batch window must be non-zero".into()));
        }
        if self.stream_buffer == 0 {
            return Err(Error::Config("stream buffer must be at least 1".into()));
        }
        if self.stream_stall_ms == 0 {
            return Err(Error::Config("stream stall grace must be non-zero".into()));
        }

        for class in CallerClass::ALL {
            let policy = self.callers.for_class(class);
            if policy.min_priority > policy.max_priority {
                return Err(Error::Config(format!(
                    "{class}: min priority {} exceeds max priority {}",
                    policy.min_priority, policy.max_priority
                )));
            }
            if policy.timeout_ms == 0 || policy.timeout_ms > policy.max_timeout_ms {
                return Err(Error::Config(format!(
                    "{class}: timeout {}ms must be in (0, {}]ms",
                    policy.timeout_ms, policy.max_timeout_ms
                )));
            }
            if !policy.allows(policy.default_priority) {
                return Err(Error::Config(format!(
                    "{class}: default priority {} outside [{}, {}]",
                    policy.default_priority, policy.min_priority, policy.max_priority
                )));
            }
        }

        for model in self.models.iter() {
            if model.memory_mb.saturating_add(self.memory.safety_margin_mb) > self.memory.ceiling_mb {
                return Err(Error::Config(format!(
                    "{} needs {}MB which can never fit under the {}MB ceiling with {}MB reserved",
                    model.model_type, model.memory_mb, self.memory.ceiling_mb, self.memory.safety_margin_mb
                )));
            }
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Parses `k=v,k=v` engine tuning strings.
fn parse_params(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::Config(format!("malformed engine parameter '{pair}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.models.get(ModelType::Chat).is_some());
        assert!(config.models.get(ModelType::Embedding).is_some());
    }

    #[test]
    fn chat_outranks_embedding_outranks_summary() {
        let callers = CallerPolicies::default();
        assert!(callers.chat.default_priority < callers.npc_embedding.default_priority);
        assert!(callers.npc_embedding.default_priority < callers.summary.default_priority);
    }

    #[test]
    fn rejects_margin_above_ceiling() {
        let mut config = SchedulerConfig::default();
        config.memory.safety_margin_mb = config.memory.ceiling_mb;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_model_that_can_never_fit() {
        let mut config = SchedulerConfig::default();
        config.memory.ceiling_mb = 10 * 1024;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_default_priority_out_of_bounds() {
        let mut config = SchedulerConfig::default();
        config.callers.summary.default_priority = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_default_timeout_above_ceiling() {
        let mut config = SchedulerConfig::default();
        config.callers.chat.timeout_ms = config.callers.chat.max_timeout_ms + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn huge_footprint_is_rejected_without_overflow() {
        let mut config = SchedulerConfig::default();
        config.models = ModelCatalog::new([ModelConfig::new(ModelType::Chat, "chat", u64::MAX)]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn parses_engine_params() {
        let params = parse_params("gpu_layers=35, rope_scale = 2.0,").unwrap();
        assert_eq!(params.get("gpu_layers").map(String::as_str), Some("35"));
        assert_eq!(params.get("rope_scale").map(String::as_str), Some("2.0"));
        assert!(parse_params("novalue").is_err());
    }
}
