use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scheduling core.
///
/// Every queued request is resolved with either a value or one of these, so the
/// type is `Clone`: a single failed embedding batch resolves many result slots.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Service unavailable for caller class {0}: circuit open")]
    ServiceUnavailable(String),

    #[error("Insufficient accelerator memory: {0}")]
    InsufficientResources(String),

    #[error("Model load failed: {0}")]
    LoadFailure(String),

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("Request expired in queue after {waited_ms}ms (timeout {timeout_ms}ms)")]
    QueueTimeout { waited_ms: u64, timeout_ms: u64 },

    #[error("Generation exceeded caller timeout of {0}ms")]
    GenerationTimeout(u64),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Pool {0} is faulted and must be reset before loading")]
    PoolFaulted(String),

    #[error("Model not resident: {0}")]
    NotResident(String),

    #[error("Invalid model state transition: {0}")]
    InvalidTransition(String),

    #[error("Request queue is full ({0})")]
    QueueFull(usize),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How an error should be treated by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureClass {
    /// Engine-reported fault; counts toward opening the breaker.
    Engine,
    /// Caller mistake, caller-side timeout or local condition; never counted.
    Neutral,
}

impl Error {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::LoadFailure(_) | Error::GenerationFailure(_) | Error::EmbeddingFailure(_) => {
                FailureClass::Engine
            }
            _ => FailureClass::Neutral,
        }
    }

    pub fn counts_as_failure(&self) -> bool {
        self.failure_class() == FailureClass::Engine
    }

    /// Stable short name, used in status output and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::InsufficientResources(_) => "insufficient_resources",
            Error::LoadFailure(_) => "load_failure",
            Error::GenerationFailure(_) => "generation_failure",
            Error::EmbeddingFailure(_) => "embedding_failure",
            Error::QueueTimeout { .. } => "queue_timeout",
            Error::GenerationTimeout(_) => "generation_timeout",
            Error::Cancelled => "cancelled",
            Error::PoolFaulted(_) => "pool_faulted",
            Error::NotResident(_) => "not_resident",
            Error::InvalidTransition(_) => "invalid_transition",
            Error::QueueFull(_) => "queue_full",
            Error::ShuttingDown => "shutting_down",
            Error::Config(_) => "config",
        }
    }
}
