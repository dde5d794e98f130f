//! Queued work items, result slots and the caller-facing generation stream.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::embedding_pool::EmbeddingOutcome;
use crate::models::traits::{ChunkSink, GenerationParams};
use crate::models::ModelType;

/// Logical category of requester, used for priority and failure isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallerClass {
    Chat,
    Summary,
    NpcEmbedding,
}

impl CallerClass {
    pub const ALL: [CallerClass; 3] = [CallerClass::Chat, CallerClass::Summary, CallerClass::NpcEmbedding];

    /// The model type this caller class is served by.
    pub fn model_type(self) -> ModelType {
        match self {
            CallerClass::Chat => ModelType::Chat,
            CallerClass::Summary => ModelType::Summary,
            CallerClass::NpcEmbedding => ModelType::Embedding,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallerClass::Chat => "chat",
            CallerClass::Summary => "summary",
            CallerClass::NpcEmbedding => "npc-embedding",
        }
    }
}

impl fmt::Display for CallerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationChunk {
    pub index: usize,
    pub text: String,
}

/// Final report of a completed generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub request_id: Uuid,
    pub model_type: ModelType,
    pub instance_id: Uuid,
    pub tokens_generated: usize,
    pub queue_wait_ms: u64,
    pub generation_ms: u64,
}

/// Everything that travels over a generation stream. Exactly one terminal event
/// (`Finished` or `Failed`) is ever sent.
#[derive(Debug)]
pub enum GenerationEvent {
    Chunk(GenerationChunk),
    Finished(GenerationSummary),
    Failed(Error),
}

/// Caller handle for a streamed generation: lazy, finite and not restartable.
#[derive(Debug)]
pub struct GenerationStream {
    request_id: Uuid,
    rx: mpsc::Receiver<GenerationEvent>,
    summary: Option<GenerationSummary>,
    done: bool,
    /// Set by the worker when this stream was left unread past the stall grace.
    stalled: Arc<AtomicBool>,
}

impl GenerationStream {
    pub(crate) fn new(request_id: Uuid, rx: mpsc::Receiver<GenerationEvent>) -> Self {
        Self {
            request_id,
            rx,
            summary: None,
            done: false,
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_stall_flag(mut self, stalled: Arc<AtomicBool>) -> Self {
        self.stalled = stalled;
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Set once the stream has finished successfully.
    pub fn summary(&self) -> Option<&GenerationSummary> {
        self.summary.as_ref()
    }

    pub async fn next_chunk(&mut self) -> Option<Result<GenerationChunk>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drains the stream into one string.
    pub async fn collect_text(mut self) -> Result<(String, GenerationSummary)> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            text.push_str(&chunk?.text);
        }
        match self.summary {
            Some(summary) => Ok((text, summary)),
            None => Err(Error::ShuttingDown),
        }
    }
}

impl Stream for GenerationStream {
    type Item = Result<GenerationChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(GenerationEvent::Chunk(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(GenerationEvent::Finished(summary))) => {
                self.summary = Some(summary);
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(GenerationEvent::Failed(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            // sender dropped without a terminal event: the worker gave up on an
            // unread stream, or the runtime tore the worker down
            Poll::Ready(None) => {
                self.done = true;
                let error = if self.stalled.load(Ordering::SeqCst) {
                    Error::Cancelled
                } else {
                    Error::ShuttingDown
                };
                Poll::Ready(Some(Err(error)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn report_to_breaker<T>(breaker: Option<&Arc<CircuitBreaker>>, result: &Result<T>) {
    if let Err(e) = result {
        debug!(error_kind = e.kind(), error = %e, "Request resolved with error");
    }
    let Some(breaker) = breaker else { return };
    match result {
        Ok(_) => breaker.record_success().await,
        Err(e) if e.counts_as_failure() => breaker.record_failure(e).await,
        Err(_) => breaker.record_neutral().await,
    }
}

/// Single-assignment result slot of a generation request. Resolving consumes it.
#[derive(Debug)]
pub struct GenerationSlot {
    events: mpsc::Sender<GenerationEvent>,
    breaker: Option<Arc<CircuitBreaker>>,
    stall_grace: Option<Duration>,
    stalled: Arc<AtomicBool>,
}

impl GenerationSlot {
    pub fn new(events: mpsc::Sender<GenerationEvent>, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            events,
            breaker,
            stall_grace: None,
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A reader that leaves the stream full for `grace` counts as abandoned.
    pub fn with_stall_grace(mut self, grace: Duration) -> Self {
        self.stall_grace = Some(grace);
        self
    }

    pub fn sink(&self) -> ChunkSink {
        let sink = ChunkSink::new(self.events.clone());
        match self.stall_grace {
            Some(grace) => sink.with_stall_guard(grace, self.stalled.clone()),
            None => sink,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.events.is_closed() || self.stalled.load(Ordering::SeqCst)
    }

    pub(crate) fn stall_flag(&self) -> Arc<AtomicBool> {
        self.stalled.clone()
    }

    pub async fn resolve(self, result: Result<GenerationSummary>) {
        report_to_breaker(self.breaker.as_ref(), &result).await;
        let event = match result {
            Ok(summary) => GenerationEvent::Finished(summary),
            Err(error) => GenerationEvent::Failed(error),
        };
        // a caller that dropped or stopped reading its stream no longer cares
        if self.stalled.load(Ordering::SeqCst) {
            let _ = self.events.try_send(event);
            return;
        }
        match self.stall_grace {
            Some(grace) => {
                let _ = self.events.send_timeout(event, grace).await;
            }
            None => {
                let _ = self.events.send(event).await;
            }
        }
    }
}

/// Single-assignment result slot of an embedding request.
#[derive(Debug)]
pub struct EmbeddingSlot {
    tx: oneshot::Sender<Result<EmbeddingOutcome>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl EmbeddingSlot {
    pub fn new(tx: oneshot::Sender<Result<EmbeddingOutcome>>, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self { tx, breaker }
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn resolve(self, result: Result<EmbeddingOutcome>) {
        report_to_breaker(self.breaker.as_ref(), &result).await;
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
pub struct GenerationJob {
    pub model_type: ModelType,
    pub prompt: String,
    pub params: GenerationParams,
    pub slot: GenerationSlot,
}

/// Embedding work. `vectors` fills up as micro-batches complete, so one job may
/// span several engine calls.
#[derive(Debug)]
pub struct EmbeddingJob {
    pub texts: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
    pub slot: EmbeddingSlot,
}

impl EmbeddingJob {
    pub fn new(texts: Vec<String>, slot: EmbeddingSlot) -> Self {
        let capacity = texts.len();
        Self {
            texts,
            vectors: Vec::with_capacity(capacity),
            slot,
        }
    }

    pub fn remaining(&self) -> usize {
        self.texts.len() - self.vectors.len()
    }

    pub fn is_complete(&self) -> bool {
        self.vectors.len() == self.texts.len()
    }
}

/// Payload the queues can settle on their own: expired, abandoned or drained at
/// shutdown.
#[async_trait]
pub trait Job: Send + 'static {
    /// The submitter has dropped its end of the result slot.
    fn is_abandoned(&self) -> bool;

    async fn fail(self, error: Error);
}

#[async_trait]
impl Job for GenerationJob {
    fn is_abandoned(&self) -> bool {
        self.slot.is_abandoned()
    }

    async fn fail(self, error: Error) {
        self.slot.resolve(Err(error)).await;
    }
}

#[async_trait]
impl Job for EmbeddingJob {
    fn is_abandoned(&self) -> bool {
        self.slot.is_abandoned()
    }

    async fn fail(self, error: Error) {
        self.slot.resolve(Err(error)).await;
    }
}

/// Tagged payload of an admitted request.
#[derive(Debug)]
pub enum RequestPayload {
    Generation(GenerationJob),
    Embedding(EmbeddingJob),
}

/// A pending unit of work, ordered by `(priority, seq)`.
#[derive(Debug)]
pub struct QueuedRequest<P = RequestPayload> {
    pub id: Uuid,
    pub caller: CallerClass,
    pub priority: u8,
    /// Submission order, assigned on admission; breaks priority ties.
    pub seq: u64,
    pub submitted_at: Instant,
    pub timeout: Duration,
    pub payload: P,
}

impl<P> QueuedRequest<P> {
    pub fn new(caller: CallerClass, priority: u8, timeout: Duration, payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            priority,
            seq: 0,
            submitted_at: Instant::now(),
            timeout,
            payload,
        }
    }

    /// `None` when the timeout reaches past what `Instant` can represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.submitted_at.checked_add(self.timeout)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now > deadline)
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }

    pub fn timeout_error(&self, now: Instant) -> Error {
        Error::QueueTimeout {
            waited_ms: self.waited(now).as_millis() as u64,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Splits off the payload, leaving the scheduling metadata.
    pub fn into_parts(self) -> (QueuedRequest<()>, P) {
        let head = QueuedRequest {
            id: self.id,
            caller: self.caller,
            priority: self.priority,
            seq: self.seq,
            submitted_at: self.submitted_at,
            timeout: self.timeout,
            payload: (),
        };
        (head, self.payload)
    }

    pub fn with_payload<Q>(self, payload: Q) -> QueuedRequest<Q> {
        QueuedRequest {
            id: self.id,
            caller: self.caller,
            priority: self.priority,
            seq: self.seq,
            submitted_at: self.submitted_at,
            timeout: self.timeout,
            payload,
        }
    }
}
