// ARCHITECTURE: Circuit Breaker - Per-Caller-Class Failure Isolation
//
// CIRCUIT BREAKER STATES:
// CLOSED (Normal Operation):
//   - All requests flow through, consecutive engine failures are counted
//   - Transition to OPEN once the count reaches `failure_threshold`
//
// OPEN (Circuit Tripped):
//   - Requests are rejected before admission, the engine is never contacted
//   - Transition to HALF-OPEN after `cooldown_ms`
//
// HALF-OPEN (Recovery Testing):
//   - Exactly one trial request is admitted
//   - Success closes the circuit, failure reopens it and restarts the cool-down
//   - A trial that ends for a caller-side reason frees the slot for another trial
//
// Only engine faults (load, generation, embedding) are counted. Invalid input and
// caller-induced timeouts never move the breaker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32, // Consecutive failures to trip the circuit (default: 5)
    pub cooldown_ms: u64,       // Time open before a trial is allowed (default: 30s)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitBreakerState {
    Closed,   // Normal operation - requests flow through
    Open,     // Circuit tripped - fail fast all requests
    HalfOpen, // Recovery testing - one trial request allowed
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    pub circuit_opened_count: u64,
    pub circuit_half_opened_count: u64,
    pub circuit_closed_count: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub time_in_current_state_ms: u64,
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_requests: 0,
            circuit_opened_count: 0,
            circuit_half_opened_count: 0,
            circuit_closed_count: 0,
            last_failure_time: None,
            last_failure_reason: None,
            time_in_current_state_ms: 0,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    state_changed_at: Instant,
    trial_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

impl BreakerInner {
    fn transition(&mut self, next: CircuitBreakerState) {
        self.state = next;
        self.state_changed_at = Instant::now();
        self.trial_in_flight = false;
        self.metrics.state = next;
        match next {
            CircuitBreakerState::Open => self.metrics.circuit_opened_count += 1,
            CircuitBreakerState::HalfOpen => self.metrics.circuit_half_opened_count += 1,
            CircuitBreakerState::Closed => self.metrics.circuit_closed_count += 1,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CircuitBreaker({})", self.name)
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                state_changed_at: Instant::now(),
                trial_in_flight: false,
                metrics: CircuitBreakerMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Admission check. In half-open state this claims the single trial slot, so
    /// every `true` must be followed by exactly one `record_*` call.
    pub async fn can_proceed(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                if inner.state_changed_at.elapsed() >= self.cooldown() {
                    inner.transition(CircuitBreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit breaker transitioned to HALF-OPEN state");
                    true
                } else {
                    inner.metrics.rejected_requests += 1;
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.rejected_requests += 1;
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.metrics.total_successes += 1;
        inner.metrics.consecutive_failures = 0;
        if inner.state == CircuitBreakerState::HalfOpen {
            inner.transition(CircuitBreakerState::Closed);
            info!(breaker = %self.name, "Circuit breaker transitioned to CLOSED state - service recovered");
        }
    }

    pub async fn record_failure(&self, error: &Error) {
        let mut inner = self.inner.write().await;
        inner.metrics.total_failures += 1;
        inner.metrics.consecutive_failures += 1;
        inner.metrics.last_failure_time = Some(Utc::now());
        inner.metrics.last_failure_reason = Some(error.to_string());

        match inner.state {
            CircuitBreakerState::Closed if inner.metrics.consecutive_failures >= self.config.failure_threshold => {
                inner.transition(CircuitBreakerState::Open);
                warn!(
                    breaker = %self.name,
                    consecutive_failures = inner.metrics.consecutive_failures,
                    "Circuit breaker OPENED - failing fast to protect the engine"
                );
            }
            CircuitBreakerState::HalfOpen => {
                inner.transition(CircuitBreakerState::Open);
                warn!(breaker = %self.name, "Trial request failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    /// Outcome that says nothing about engine health. Frees a claimed trial slot.
    pub async fn record_neutral(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == CircuitBreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub async fn get_state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }

    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read().await;
        let mut metrics = inner.metrics.clone();
        metrics.time_in_current_state_ms = inner.state_changed_at.elapsed().as_millis() as u64;
        metrics
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitBreakerState::Closed;
        inner.state_changed_at = Instant::now();
        inner.trial_in_flight = false;
        inner.metrics = CircuitBreakerMetrics::default();
        info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED state");
    }

    pub async fn force_open(&self) {
        let mut inner = self.inner.write().await;
        inner.transition(CircuitBreakerState::Open);
        warn!(breaker = %self.name, "Circuit breaker manually forced to OPEN state");
    }
}
