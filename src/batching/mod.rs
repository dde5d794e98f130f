// ARCHITECTURE: Embedding Micro-Batching
//
// Requests from the embedding queue are buffered until either
// - the buffered texts reach `max_batch_size`, or
// - `batch_window_ms` has elapsed since the first item was buffered, or
// - a buffered request is about to reach its deadline,
// then one `embed` call goes out for the concatenated texts and the vectors are
// handed back to each request in order. A request larger than the remaining room
// is split: the processed part is kept on the job and the rest stays at the front
// of the buffer for the next batch. Requests that expire while buffered, before
// any of their texts went out, resolve with a queue timeout instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::embedding_pool::{EmbeddingOutcome, EmbeddingPool};
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::request::{EmbeddingJob, Job, QueuedRequest};

/// Configuration for batching behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Texts per engine call.
    pub max_batch_size: usize,
    pub batch_window_ms: u64,
    /// Admission bound for each request queue.
    pub max_queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_window_ms: 200,
            max_queue_size: 256,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total_requests: u64,
    pub total_texts: u64,
    pub total_batches: u64,
    pub failed_batches: u64,
    pub avg_batch_size: f64,
    pub avg_processing_time_ms: f64,
}

type PendingEmbedding = QueuedRequest<EmbeddingJob>;

pub struct EmbeddingBatcher {
    config: BatchConfig,
    queue: Arc<PriorityQueue<EmbeddingJob>>,
    pool: Arc<EmbeddingPool>,
    stats: Mutex<BatchStats>,
}

impl std::fmt::Debug for EmbeddingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingBatcher").field("config", &self.config).finish()
    }
}

impl EmbeddingBatcher {
    pub fn new(config: BatchConfig, queue: Arc<PriorityQueue<EmbeddingJob>>, pool: Arc<EmbeddingPool>) -> Self {
        Self {
            config,
            queue,
            pool,
            stats: Mutex::new(BatchStats::default()),
        }
    }

    /// Runs until the queue is closed and the buffer is empty.
    pub async fn run(self: Arc<Self>) {
        info!("Starting embedding batch loop with config: {:?}", self.config);

        let mut pending: VecDeque<PendingEmbedding> = VecDeque::new();
        loop {
            if pending.is_empty() {
                match self.queue.pop().await {
                    Some(request) => pending.push_back(request),
                    None => break,
                }
            }
            self.fill(&mut pending).await;
            self.process_front(&mut pending).await;
        }

        info!("Embedding batch loop stopped");
    }

    fn buffered_texts(pending: &VecDeque<PendingEmbedding>) -> usize {
        pending.iter().map(|r| r.payload.remaining()).sum()
    }

    /// Buffers more requests until the batch is full, the window closes, or a
    /// buffered request is about to expire.
    async fn fill(&self, pending: &mut VecDeque<PendingEmbedding>) {
        let mut deadline = pending
            .iter()
            .fold(Instant::now() + self.config.window(), |d, r| earliest(d, r));

        while Self::buffered_texts(pending) < self.config.max_batch_size {
            if let Some(request) = self.queue.try_pop().await {
                deadline = earliest(deadline, &request);
                pending.push_back(request);
                continue;
            }
            if self.queue.is_closed() {
                break;
            }
            if timeout_at(deadline, self.queue.wait_for_push()).await.is_err() {
                debug!(buffered = pending.len(), "Batch window elapsed");
                break;
            }
        }
    }

    /// Settles buffered requests that can no longer be served: expired before any
    /// of their texts went out, or dropped by the caller.
    async fn settle_unservable(&self, pending: &mut VecDeque<PendingEmbedding>) {
        let now = Instant::now();
        let (unservable, live): (Vec<_>, Vec<_>) = pending.drain(..).partition(|r| {
            r.payload.is_abandoned() || (r.payload.vectors.is_empty() && r.is_expired(now))
        });
        pending.extend(live);

        for request in unservable {
            if request.payload.is_abandoned() {
                request.payload.fail(Error::Cancelled).await;
            } else {
                let error = request.timeout_error(now);
                warn!(request_id = %request.id, error = %error, "Buffered embedding request expired before dispatch");
                request.payload.fail(error).await;
            }
        }
    }

    /// One engine call covering up to `max_batch_size` texts from the front of the buffer.
    async fn process_front(&self, pending: &mut VecDeque<PendingEmbedding>) {
        self.settle_unservable(pending).await;

        let max = self.config.max_batch_size;
        let mut texts = Vec::with_capacity(max);
        let mut takes = Vec::new();
        for request in pending.iter() {
            if texts.len() >= max {
                break;
            }
            let job = &request.payload;
            let start = job.vectors.len();
            let take = job.remaining().min(max - texts.len());
            texts.extend_from_slice(&job.texts[start..start + take]);
            takes.push(take);
        }
        if texts.is_empty() {
            return;
        }

        let batch_start = Instant::now();
        let result = self.embed(&texts).await;
        let processing_time_ms = batch_start.elapsed().as_millis() as u64;

        let mut completed = 0;
        match result {
            Ok(EmbeddingOutcome::Vectors(vectors)) => {
                let mut vectors = vectors.into_iter();
                for take in takes {
                    let Some(front) = pending.front_mut() else { break };
                    front.payload.vectors.extend(vectors.by_ref().take(take));
                    if front.payload.is_complete() {
                        if let Some(request) = pending.pop_front() {
                            let EmbeddingJob { vectors, slot, .. } = request.payload;
                            slot.resolve(Ok(EmbeddingOutcome::Vectors(vectors))).await;
                            completed += 1;
                        }
                    }
                }
            }
            Ok(EmbeddingOutcome::Disabled) => {
                for _ in 0..takes.len() {
                    if let Some(request) = pending.pop_front() {
                        request.payload.slot.resolve(Ok(EmbeddingOutcome::Disabled)).await;
                        completed += 1;
                    }
                }
            }
            Err(e) => {
                error!(texts = texts.len(), error = %e, "Embedding batch failed");
                for _ in 0..takes.len() {
                    if let Some(request) = pending.pop_front() {
                        request.payload.fail(e.clone()).await;
                    }
                }
                self.stats.lock().await.failed_batches += 1;
            }
        }

        self.update_stats(completed, texts.len(), processing_time_ms).await;
        info!(
            texts = texts.len(),
            completed,
            carried = pending.len(),
            processing_time_ms,
            "Completed embedding batch"
        );
    }

    /// Brings the model back if an operator unloaded it, then embeds.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingOutcome> {
        if self.pool.is_enabled() {
            if let Err(e) = self.pool.ensure_loaded().await {
                if matches!(e, Error::LoadFailure(_)) && self.pool.reset() {
                    warn!(error = %e, "Embedding model load failed, pool reset for the next batch");
                }
                return Err(e);
            }
        }
        self.pool.embed(texts).await
    }

    async fn update_stats(&self, requests: usize, texts: usize, processing_time_ms: u64) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += requests as u64;
        stats.total_texts += texts as u64;
        stats.total_batches += 1;
        stats.avg_batch_size = stats.total_texts as f64 / stats.total_batches as f64;

        // Rolling average of processing time
        let alpha = 0.1;
        if stats.total_batches == 1 {
            stats.avg_processing_time_ms = processing_time_ms as f64;
        } else {
            stats.avg_processing_time_ms =
                alpha * (processing_time_ms as f64) + (1.0 - alpha) * stats.avg_processing_time_ms;
        }
    }

    pub async fn get_stats(&self) -> BatchStats {
        self.stats.lock().await.clone()
    }
}

/// Earlier of `deadline` and the moment `request` expires. Requests that already
/// have vectors are finished regardless of their deadline.
fn earliest(deadline: Instant, request: &PendingEmbedding) -> Instant {
    if !request.payload.vectors.is_empty() {
        return deadline;
    }
    match request.deadline() {
        // expiry is strict, so stop just past the deadline
        Some(expires) => deadline.min(expires.checked_add(Duration::from_millis(1)).unwrap_or(expires)),
        None => deadline,
    }
}
