// ARCHITECTURE: Request Queue Manager - Supervised Workers Over Two Priority Queues
//
// WORKERS (spawned by `start`, joined by `shutdown`):
// - generation worker: pops the most urgent generation request, swaps the right
//   model in, streams the result into the request's slot. One at a time.
// - embedding batcher: drains the embedding queue in micro-batches.
// - demand predictor: periodic, advisory preloading into the generation pool.
// - one expiry task per queue: resolves queued requests as their deadlines pass.
//
// Every admitted request is resolved exactly once: by a worker, by queue expiry,
// or by the shutdown drain.

pub mod distributor;
pub mod predictor;
pub mod queue;
pub mod request;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batching::{BatchStats, EmbeddingBatcher};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::models::{EmbeddingPool, GenerationPool};

use predictor::DemandPredictor;
use queue::PriorityQueue;
use request::{EmbeddingJob, GenerationJob, GenerationSummary, Job, QueuedRequest, RequestPayload};

pub use distributor::{RequestDistributor, SchedulerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub generation: usize,
    pub embedding: usize,
}

pub struct RequestQueueManager {
    generation_pool: Arc<GenerationPool>,
    embedding_pool: Arc<EmbeddingPool>,
    generation_queue: Arc<PriorityQueue<GenerationJob>>,
    embedding_queue: Arc<PriorityQueue<EmbeddingJob>>,
    batcher: Arc<EmbeddingBatcher>,
    predictor: Arc<DemandPredictor>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for RequestQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueueManager")
            .field("depths", &self.queue_depths())
            .finish()
    }
}

impl RequestQueueManager {
    pub fn new(config: &SchedulerConfig, generation_pool: Arc<GenerationPool>, embedding_pool: Arc<EmbeddingPool>) -> Self {
        let capacity = config.batching.max_queue_size;
        let generation_queue = Arc::new(PriorityQueue::new("generation", capacity));
        let embedding_queue = Arc::new(PriorityQueue::new("embedding", capacity));
        let batcher = Arc::new(EmbeddingBatcher::new(
            config.batching.clone(),
            embedding_queue.clone(),
            embedding_pool.clone(),
        ));

        Self {
            generation_pool,
            embedding_pool,
            generation_queue,
            embedding_queue,
            batcher,
            predictor: Arc::new(DemandPredictor::new(config.predictor.clone())),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Loads the embedding model and spawns the workers. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // a failed embedding load must not keep generation from starting; the
        // batcher retries on the first batch
        match self.embedding_pool.start().await {
            Ok(Some(outcome)) => info!(instance_id = %outcome.instance_id, "Embedding model resident"),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Embedding model failed to load at startup");
                self.embedding_pool.reset();
            }
        }

        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(run_generation_worker(
            self.generation_pool.clone(),
            self.generation_queue.clone(),
        )));
        workers.push(tokio::spawn(self.batcher.clone().run()));
        workers.push(tokio::spawn(
            self.generation_queue.clone().run_expiry(self.cancel.child_token()),
        ));
        workers.push(tokio::spawn(
            self.embedding_queue.clone().run_expiry(self.cancel.child_token()),
        ));
        workers.push(tokio::spawn(self.predictor.clone().run(
            self.generation_pool.clone(),
            self.generation_queue.clone(),
            self.cancel.child_token(),
        )));

        info!(workers = workers.len(), "Request queue manager started");
        Ok(())
    }

    /// Admits a request into the queue matching its payload.
    pub async fn enqueue(&self, request: QueuedRequest<RequestPayload>) -> Result<()> {
        let caller = request.caller;
        let (head, payload) = request.into_parts();
        match payload {
            RequestPayload::Generation(job) => self.generation_queue.push(head.with_payload(job)).await?,
            RequestPayload::Embedding(job) => self.embedding_queue.push(head.with_payload(job)).await?,
        }
        self.predictor.record(caller);
        Ok(())
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            generation: self.generation_queue.len(),
            embedding: self.embedding_queue.len(),
        }
    }

    pub async fn batch_stats(&self) -> BatchStats {
        self.batcher.get_stats().await
    }

    pub fn predictor(&self) -> &Arc<DemandPredictor> {
        &self.predictor
    }

    /// Stops the workers, resolves everything still queued with `ShuttingDown`
    /// and unloads both pools. Work already dispatched finishes first.
    pub async fn shutdown(&self) {
        info!("Shutting down request queue manager");
        self.cancel.cancel();

        let drained = self.generation_queue.close(Error::ShuttingDown).await
            + self.embedding_queue.close(Error::ShuttingDown).await;

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        self.generation_pool.force_unload().await;
        self.embedding_pool.force_unload().await;
        info!(drained, "Request queue manager stopped");
    }
}

async fn run_generation_worker(pool: Arc<GenerationPool>, queue: Arc<PriorityQueue<GenerationJob>>) {
    info!("Generation worker started");
    while let Some(request) = queue.pop().await {
        serve_generation(&pool, request).await;
    }
    info!("Generation worker stopped");
}

async fn serve_generation(pool: &GenerationPool, request: QueuedRequest<GenerationJob>) {
    let dispatched = Instant::now();
    if request.is_expired(dispatched) {
        let error = request.timeout_error(dispatched);
        warn!(request_id = %request.id, error = %error, "Request expired at dispatch");
        request.payload.fail(error).await;
        return;
    }

    let request_id = request.id;
    let queue_wait_ms = request.waited(dispatched).as_millis() as u64;
    let GenerationJob {
        model_type,
        prompt,
        params,
        slot,
    } = request.payload;
    debug!(%request_id, caller = %request.caller, %model_type, queue_wait_ms, "Dispatching generation request");

    if let Err(e) = pool.ensure_loaded(model_type).await {
        let load_failed = matches!(e, Error::LoadFailure(_));
        slot.resolve(Err(e)).await;
        // fail this request once, then let the next one try again
        if load_failed && pool.reset() {
            warn!(%model_type, "Generation pool reset after failed load");
        }
        return;
    }

    let mut sink = slot.sink();
    let started = Instant::now();
    let generation = pool.generate(model_type, &prompt, &params, &mut sink);
    let result = match params.max_generation_ms {
        Some(limit_ms) => match tokio::time::timeout(Duration::from_millis(limit_ms), generation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%request_id, limit_ms, "Generation exceeded caller timeout");
                Err(Error::GenerationTimeout(limit_ms))
            }
        },
        None => generation.await,
    };
    drop(sink);

    let result = match result {
        Ok(_) if slot.is_abandoned() => Err(Error::Cancelled),
        Ok((instance_id, stats)) => Ok(GenerationSummary {
            request_id,
            model_type,
            instance_id,
            tokens_generated: stats.tokens_generated,
            queue_wait_ms,
            generation_ms: started.elapsed().as_millis() as u64,
        }),
        Err(e) => Err(e),
    };
    slot.resolve(result).await;
}
