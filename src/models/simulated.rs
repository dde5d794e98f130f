//! In-process engine with no accelerator behind it. Memory is tracked through an
//! `AccountingProbe`, so the resource monitor sees loads and unloads exactly as it
//! would on hardware. Delays and faults are injectable for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::ModelConfig;
use crate::models::traits::{BoxedModel, ChunkSink, EngineError, GenerationParams, GenerationStats, InferenceEngine, ModelTrait};
use crate::models::ModelType;
use crate::resources::AccountingProbe;

/// Length of the vectors produced by simulated embedding models.
pub const SIMULATED_EMBEDDING_DIMS: usize = 8;

/// Overrides the memory a simulated model actually takes, in MB.
pub const SIMULATED_MEMORY_PARAM: &str = "simulated_mb";

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LoadStarted { model_type: ModelType, at: Instant },
    LoadFinished { model_type: ModelType, at: Instant },
    LoadFailed { model_type: ModelType, at: Instant },
    UnloadFinished { model_type: ModelType, at: Instant },
    GenerationStarted { model_type: ModelType, prompt: String, at: Instant },
    Embedded { batch_size: usize, at: Instant },
}

impl EngineEvent {
    pub fn at(&self) -> Instant {
        match self {
            EngineEvent::LoadStarted { at, .. }
            | EngineEvent::LoadFinished { at, .. }
            | EngineEvent::LoadFailed { at, .. }
            | EngineEvent::UnloadFinished { at, .. }
            | EngineEvent::GenerationStarted { at, .. }
            | EngineEvent::Embedded { at, .. } => *at,
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    failing_loads: HashSet<ModelType>,
    generation: Option<EngineError>,
    embedding: Option<EngineError>,
}

#[derive(Debug, Default)]
struct Shared {
    events: StdMutex<Vec<EngineEvent>>,
    faults: StdMutex<FaultPlan>,
    live: AtomicUsize,
}

impl Shared {
    fn push(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Debug)]
pub struct SimulatedEngine {
    probe: Arc<AccountingProbe>,
    load_delay: Duration,
    token_delay: Duration,
    embed_delay: Duration,
    shared: Arc<Shared>,
    load_counts: StdMutex<HashMap<ModelType, usize>>,
}

impl SimulatedEngine {
    pub fn new(probe: Arc<AccountingProbe>) -> Self {
        Self {
            probe,
            load_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            embed_delay: Duration::ZERO,
            shared: Arc::new(Shared::default()),
            load_counts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = delay;
        self
    }

    pub fn probe(&self) -> &Arc<AccountingProbe> {
        &self.probe
    }

    pub fn fail_loads(&self, model_type: ModelType, failing: bool) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            if failing {
                faults.failing_loads.insert(model_type);
            } else {
                faults.failing_loads.remove(&model_type);
            }
        }
    }

    /// Every generation returns `fault` until cleared with `None`.
    pub fn fail_generations(&self, fault: Option<EngineError>) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.generation = fault;
        }
    }

    pub fn fail_embeddings(&self, fault: Option<EngineError>) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.embedding = fault;
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.shared.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Sizes of every embedding call, in order.
    pub fn embed_batches(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Embedded { batch_size, .. } => Some(batch_size),
                _ => None,
            })
            .collect()
    }

    /// Prompts in the order generations started.
    pub fn generated_prompts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::GenerationStarted { prompt, .. } => Some(prompt),
                _ => None,
            })
            .collect()
    }

    pub fn load_count(&self, model_type: ModelType) -> usize {
        self.load_counts
            .lock()
            .map(|c| c.get(&model_type).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Instances loaded and not yet unloaded.
    pub fn live_instances(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for SimulatedEngine {
    async fn load(&self, config: &ModelConfig) -> Result<BoxedModel, EngineError> {
        let model_type = config.model_type;
        self.shared.push(EngineEvent::LoadStarted { model_type, at: Instant::now() });
        if !self.load_delay.is_zero() {
            sleep(self.load_delay).await;
        }

        let failing = self
            .shared
            .faults
            .lock()
            .map(|f| f.failing_loads.contains(&model_type))
            .unwrap_or(false);
        if failing {
            self.shared.push(EngineEvent::LoadFailed { model_type, at: Instant::now() });
            return Err(EngineError::Fault(format!("simulated load failure for {}", config.path)));
        }

        let memory_mb = config
            .params
            .get(SIMULATED_MEMORY_PARAM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.memory_mb);
        self.probe.allocate(memory_mb);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.load_counts.lock() {
            *counts.entry(model_type).or_insert(0) += 1;
        }
        self.shared.push(EngineEvent::LoadFinished { model_type, at: Instant::now() });
        debug!(%model_type, memory_mb, "Simulated model loaded");

        Ok(Box::new(SimulatedModel {
            model_type,
            name: format!("simulated-{model_type}"),
            memory_mb,
            token_delay: self.token_delay,
            embed_delay: self.embed_delay,
            probe: self.probe.clone(),
            shared: self.shared.clone(),
        }))
    }
}

#[derive(Debug)]
struct SimulatedModel {
    model_type: ModelType,
    name: String,
    memory_mb: u64,
    token_delay: Duration,
    embed_delay: Duration,
    probe: Arc<AccountingProbe>,
    shared: Arc<Shared>,
}

fn embed_text(text: &str) -> Vec<f32> {
    (0..SIMULATED_EMBEDDING_DIMS)
        .map(|i| {
            let folded = text
                .bytes()
                .fold(i as u64 + 1, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            (folded % 1000) as f32 / 1000.0
        })
        .collect()
}

#[async_trait]
impl ModelTrait for SimulatedModel {
    fn model_type(&self) -> ModelType {
        self.model_type
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    async fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut ChunkSink,
    ) -> Result<GenerationStats, EngineError> {
        if self.model_type == ModelType::Embedding {
            return Err(EngineError::Unsupported(format!("{} cannot generate", self.name)));
        }
        self.shared.push(EngineEvent::GenerationStarted {
            model_type: self.model_type,
            prompt: prompt.to_string(),
            at: Instant::now(),
        });
        let fault = self.shared.faults.lock().ok().and_then(|f| f.generation.clone());
        if let Some(fault) = fault {
            return Err(fault);
        }

        // echoes the prompt back, one word per token
        let reply = format!("[{}] {}", self.model_type, prompt);
        let mut tokens = 0;
        for word in reply.split_whitespace().take(params.max_tokens) {
            if params.stop.iter().any(|s| s == word) {
                break;
            }
            if !self.token_delay.is_zero() {
                sleep(self.token_delay).await;
            }
            if !sink.emit(format!("{word} ")).await {
                break;
            }
            tokens += 1;
        }
        Ok(GenerationStats { tokens_generated: tokens })
    }

    async fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if self.model_type != ModelType::Embedding {
            return Err(EngineError::Unsupported(format!("{} cannot embed", self.name)));
        }
        if !self.embed_delay.is_zero() {
            sleep(self.embed_delay).await;
        }
        self.shared.push(EngineEvent::Embedded {
            batch_size: texts.len(),
            at: Instant::now(),
        });
        let fault = self.shared.faults.lock().ok().and_then(|f| f.embedding.clone());
        if let Some(fault) = fault {
            return Err(fault);
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }

    async fn unload(self: Box<Self>) -> Result<(), EngineError> {
        self.probe.release(self.memory_mb);
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        self.shared.push(EngineEvent::UnloadFinished {
            model_type: self.model_type,
            at: Instant::now(),
        });
        Ok(())
    }
}
