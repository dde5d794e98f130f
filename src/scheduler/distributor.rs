// ARCHITECTURE: Request Distributor - Validation, Failure Isolation, Admission
//
// Every inbound request goes through three gates before it reaches a queue:
// 1. validation against its caller class (non-empty input, priority bounds)
// 2. the caller class's circuit breaker (fail fast while open)
// 3. queue admission (bounded; rejected requests are resolved, never orphaned)
//
// Defaults for priority and timeout come from the caller class policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::batching::BatchStats;
use crate::config::{CallerPolicy, SchedulerConfig};
use crate::error::{Error, Result};
use crate::models::{
    CircuitBreaker, CircuitBreakerState, EmbeddingOutcome, EmbeddingPool, GenerationParams, GenerationPool,
    InferenceEngine, ModelType, PoolKind, PoolStatus, SwapOutcome,
};
use crate::resources::{MemoryProbe, MemoryReading, ResourceMonitor};
use crate::scheduler::request::{
    CallerClass, EmbeddingJob, EmbeddingSlot, GenerationJob, GenerationSlot, GenerationStream, QueuedRequest,
    RequestPayload,
};
use crate::scheduler::{QueueDepths, RequestQueueManager};

/// Read-only snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub resident_generation_model: Option<ModelType>,
    pub resident_embedding_model: Option<ModelType>,
    pub queue_depths: QueueDepths,
    pub breaker_states: BTreeMap<CallerClass, CircuitBreakerState>,
    pub generation_pool: PoolStatus,
    pub embedding_pool: PoolStatus,
    pub memory: Option<MemoryReading>,
    pub batching: BatchStats,
    pub embeddings_enabled: bool,
}

pub struct RequestDistributor {
    config: SchedulerConfig,
    monitor: Arc<ResourceMonitor>,
    generation_pool: Arc<GenerationPool>,
    embedding_pool: Arc<EmbeddingPool>,
    manager: RequestQueueManager,
    breakers: BTreeMap<CallerClass, Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for RequestDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDistributor")
            .field("manager", &self.manager)
            .finish()
    }
}

impl RequestDistributor {
    /// Wires monitor, pools, queues and breakers. Nothing runs until `start`.
    pub fn new(config: SchedulerConfig, engine: Arc<dyn InferenceEngine>, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(ResourceMonitor::new(probe, &config.memory));
        let generation_pool = Arc::new(GenerationPool::new(
            engine.clone(),
            monitor.clone(),
            config.models.clone(),
        ));
        let embedding_pool = Arc::new(EmbeddingPool::new(
            engine,
            monitor.clone(),
            config.models.clone(),
            config.embeddings_enabled,
        ));
        let manager = RequestQueueManager::new(&config, generation_pool.clone(), embedding_pool.clone());

        let breakers = CallerClass::ALL
            .into_iter()
            .map(|class| {
                let breaker = CircuitBreaker::with_config(class.as_str(), config.breaker.clone());
                (class, Arc::new(breaker))
            })
            .collect();

        Ok(Self {
            config,
            monitor,
            generation_pool,
            embedding_pool,
            manager,
            breakers,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.manager.start().await
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn breaker(&self, caller: CallerClass) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(&caller)
    }

    pub fn generation_pool(&self) -> &Arc<GenerationPool> {
        &self.generation_pool
    }

    pub fn embedding_pool(&self) -> &Arc<EmbeddingPool> {
        &self.embedding_pool
    }

    pub fn queue_manager(&self) -> &RequestQueueManager {
        &self.manager
    }

    fn policy(&self, caller: CallerClass) -> &CallerPolicy {
        self.config.callers.for_class(caller)
    }

    fn resolve_admission(
        &self,
        caller: CallerClass,
        priority: Option<u8>,
        timeout: Option<Duration>,
    ) -> Result<(u8, Duration)> {
        let policy = self.policy(caller);
        let priority = priority.unwrap_or(policy.default_priority);
        if !policy.allows(priority) {
            return Err(Error::InvalidInput(format!(
                "priority {priority} outside [{}, {}] for {caller}",
                policy.min_priority, policy.max_priority
            )));
        }

        let timeout = timeout.unwrap_or_else(|| policy.timeout());
        if timeout.is_zero() {
            return Err(Error::InvalidInput("timeout must be non-zero".into()));
        }
        if timeout > policy.max_timeout() {
            return Err(Error::InvalidInput(format!(
                "timeout {}ms exceeds the {}ms limit for {caller}",
                timeout.as_millis(),
                policy.max_timeout_ms
            )));
        }
        Ok((priority, timeout))
    }

    /// Claims admission from the caller's breaker.
    async fn admit(&self, caller: CallerClass) -> Result<Arc<CircuitBreaker>> {
        let breaker = self
            .breakers
            .get(&caller)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("unknown caller class {caller}")))?;
        if !breaker.can_proceed().await {
            debug!(%caller, "Circuit open, rejecting request");
            return Err(Error::ServiceUnavailable(caller.to_string()));
        }
        Ok(breaker)
    }

    pub async fn submit_generation(
        &self,
        caller: CallerClass,
        prompt: impl Into<String>,
        params: GenerationParams,
        priority: Option<u8>,
        timeout: Option<Duration>,
    ) -> Result<GenerationStream> {
        let prompt = prompt.into();
        let model_type = caller.model_type();
        if model_type.pool() != PoolKind::Generation {
            return Err(Error::InvalidInput(format!("{caller} callers cannot submit generation requests")));
        }
        if prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt is empty".into()));
        }
        if params.max_tokens == 0 {
            return Err(Error::InvalidInput("max_tokens must be at least 1".into()));
        }
        if params.max_generation_ms == Some(0) {
            return Err(Error::InvalidInput("generation timeout must be non-zero".into()));
        }
        let (priority, timeout) = self.resolve_admission(caller, priority, timeout)?;
        let breaker = self.admit(caller).await?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let slot = GenerationSlot::new(tx, Some(breaker)).with_stall_grace(self.config.stream_stall_grace());
        let stalled = slot.stall_flag();
        let job = GenerationJob {
            model_type,
            prompt,
            params,
            slot,
        };
        let request = QueuedRequest::new(caller, priority, timeout, RequestPayload::Generation(job));
        let request_id = request.id;

        self.manager.enqueue(request).await?;
        Ok(GenerationStream::new(request_id, rx).with_stall_flag(stalled))
    }

    /// Resolves once every text has a vector, in input order.
    pub async fn submit_embedding(
        &self,
        caller: CallerClass,
        texts: Vec<String>,
        priority: Option<u8>,
        timeout: Option<Duration>,
    ) -> Result<EmbeddingOutcome> {
        if caller.model_type() != ModelType::Embedding {
            return Err(Error::InvalidInput(format!("{caller} callers cannot submit embedding requests")));
        }
        if texts.is_empty() {
            return Err(Error::InvalidInput("embedding request has no texts".into()));
        }
        if let Some(index) = texts.iter().position(|t| t.is_empty()) {
            return Err(Error::InvalidInput(format!("text {index} is empty")));
        }
        let (priority, timeout) = self.resolve_admission(caller, priority, timeout)?;
        if !self.embedding_pool.is_enabled() {
            return Ok(EmbeddingOutcome::Disabled);
        }
        let breaker = self.admit(caller).await?;

        let (tx, rx) = oneshot::channel();
        let job = EmbeddingJob::new(texts, EmbeddingSlot::new(tx, Some(breaker)));
        let request = QueuedRequest::new(caller, priority, timeout, RequestPayload::Embedding(job));

        self.manager.enqueue(request).await?;
        rx.await.unwrap_or(Err(Error::ShuttingDown))
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let mut breaker_states = BTreeMap::new();
        for (class, breaker) in &self.breakers {
            breaker_states.insert(*class, breaker.get_state().await);
        }

        SchedulerStatus {
            resident_generation_model: self.generation_pool.resident_type(),
            resident_embedding_model: self.embedding_pool.resident_type(),
            queue_depths: self.manager.queue_depths(),
            breaker_states,
            generation_pool: self.generation_pool.status(),
            embedding_pool: self.embedding_pool.status(),
            memory: self.monitor.reading(),
            batching: self.manager.batch_stats().await,
            embeddings_enabled: self.embedding_pool.is_enabled(),
        }
    }

    /// Tears down everything the pool holds and clears its fault. Returns the
    /// model that was resident.
    pub async fn force_unload(&self, pool: PoolKind) -> Option<ModelType> {
        info!(%pool, "Forced unload requested");
        match pool {
            PoolKind::Generation => self.generation_pool.force_unload().await,
            PoolKind::Embedding => self.embedding_pool.force_unload().await,
        }
    }

    /// Replaces the pool's model with a fresh instance of `model_type`, even if
    /// that type is already resident.
    pub async fn force_reload(&self, pool: PoolKind, model_type: ModelType) -> Result<SwapOutcome> {
        if !pool.accepts(model_type) {
            return Err(Error::InvalidInput(format!("{pool} pool cannot hold a {model_type} model")));
        }
        info!(%pool, %model_type, "Forced reload requested");
        match pool {
            PoolKind::Generation => self.generation_pool.force_reload(model_type).await,
            PoolKind::Embedding if !self.embedding_pool.is_enabled() => {
                Err(Error::InvalidInput("embeddings are disabled".into()))
            }
            PoolKind::Embedding => self.embedding_pool.force_reload(model_type).await,
        }
    }

    /// Clears a pool's `Error` state. Returns whether it was faulted.
    pub fn reset_pool(&self, pool: PoolKind) -> bool {
        let was_faulted = match pool {
            PoolKind::Generation => self.generation_pool.reset(),
            PoolKind::Embedding => self.embedding_pool.reset(),
        };
        if !was_faulted {
            warn!(%pool, "Reset requested but pool was not faulted");
        }
        was_faulted
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
