// ================================================================================================
// CIRCUIT BREAKER PATTERNS & FAULT TOLERANCE TEST SUITE
// ================================================================================================
//
// PURPOSE:
// Validates the per-caller-class circuit breaker that keeps a failing engine from being
// hammered by one workload while the others keep flowing.
//
// ANALYTICAL FRAMEWORK:
// - State Machine Validation: CLOSED → OPEN → HALF-OPEN transitions
// - Failure Classification: only engine faults move the breaker
// - Recovery Mechanisms: single trial admission under concurrency
// - Operational Controls: force_open / reset and metrics visibility
// - Performance Analysis: admission overhead in the closed state
//
// PRODUCTION REQUIREMENTS TESTED:
// ✅ Consecutive failure threshold trips the circuit
// ✅ Cool-down gates the transition to HALF-OPEN
// ✅ Exactly one trial is admitted no matter how many callers race
// ✅ Caller-side errors never count as failures
// ✅ Manual controls and metrics stay consistent

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use ai_inference_scheduler::models::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use ai_inference_scheduler::Error;

fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
    CircuitBreaker::with_config(
        "chat",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        },
    )
}

/// Feeds an outcome to the breaker the way a request slot does.
async fn report(cb: &CircuitBreaker, outcome: Result<(), Error>) {
    match outcome {
        Ok(()) => cb.record_success().await,
        Err(e) if e.counts_as_failure() => cb.record_failure(&e).await,
        Err(_) => cb.record_neutral().await,
    }
}

// ================================================================================================
// TEST SUITE 1: CIRCUIT BREAKER STATE MACHINE FUNDAMENTALS
// ================================================================================================

#[cfg(test)]
mod state_machine_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_state_cycle() {
        println!("🔄 TEST: CLOSED → OPEN → HALF-OPEN → CLOSED");
        let cb = breaker(3, 100);
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);

        for i in 0..3 {
            assert!(cb.can_proceed().await, "request {i} admitted while closed");
            report(&cb, Err(Error::GenerationFailure("cuda oom".into()))).await;
        }
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
        assert!(!cb.can_proceed().await);
        println!("🔴 Circuit open after 3 consecutive failures");

        sleep(Duration::from_millis(150)).await;
        assert!(cb.can_proceed().await);
        assert_eq!(cb.get_state().await, CircuitBreakerState::HalfOpen);
        println!("🟡 Trial admitted after cool-down");

        report(&cb, Ok(())).await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);
        println!("🟢 Circuit closed after successful trial");

        let metrics = cb.get_metrics().await;
        assert_eq!(metrics.circuit_opened_count, 1);
        assert_eq!(metrics.circuit_half_opened_count, 1);
        assert_eq!(metrics.circuit_closed_count, 1);
        assert_eq!(metrics.total_failures, 3);
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_stays_open_until_cooldown() {
        let cb = breaker(1, 300);
        report(&cb, Err(Error::LoadFailure("weights missing".into()))).await;

        for _ in 0..5 {
            assert!(!cb.can_proceed().await);
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
        assert_eq!(cb.get_metrics().await.rejected_requests, 5);
    }
}

// ================================================================================================
// TEST SUITE 2: FAILURE CLASSIFICATION
// ================================================================================================

#[cfg(test)]
mod failure_classification_tests {
    use super::*;

    #[tokio::test]
    async fn test_caller_side_errors_are_neutral() {
        println!("🧪 TEST: only engine faults count toward the threshold");
        let cb = breaker(2, 60_000);

        let neutral = [
            Error::InvalidInput("empty prompt".into()),
            Error::QueueTimeout { waited_ms: 120, timeout_ms: 100 },
            Error::Cancelled,
            Error::ShuttingDown,
        ];
        for e in neutral {
            assert!(!e.counts_as_failure(), "{e} must not count");
            report(&cb, Err(e)).await;
        }
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);
        assert_eq!(cb.get_metrics().await.total_failures, 0);

        report(&cb, Err(Error::EmbeddingFailure("nan".into()))).await;
        report(&cb, Err(Error::GenerationFailure("fault".into()))).await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);

        let metrics = cb.get_metrics().await;
        assert_eq!(metrics.last_failure_reason.as_deref(), Some("Generation failed: fault"));
        assert!(metrics.last_failure_time.is_some());
    }

    #[tokio::test]
    async fn test_neutral_trial_outcome_keeps_half_open() {
        let cb = breaker(1, 20);
        report(&cb, Err(Error::LoadFailure("x".into()))).await;
        sleep(Duration::from_millis(40)).await;

        assert!(cb.can_proceed().await);
        report(&cb, Err(Error::Cancelled)).await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::HalfOpen);

        assert!(cb.can_proceed().await, "freed trial slot can be claimed again");
        report(&cb, Err(Error::LoadFailure("still broken".into()))).await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
    }
}

// ================================================================================================
// TEST SUITE 3: CONCURRENT RECOVERY
// ================================================================================================

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_trial_under_contention() {
        println!("🏁 TEST: 32 callers race for the half-open trial");
        let cb = Arc::new(breaker(1, 30));
        report(&cb, Err(Error::GenerationFailure("fault".into()))).await;
        sleep(Duration::from_millis(60)).await;

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.can_proceed().await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(cb.get_state().await, CircuitBreakerState::HalfOpen);
        assert_eq!(cb.get_metrics().await.rejected_requests, 31);
        println!("✅ Exactly one trial admitted");
    }
}

// ================================================================================================
// TEST SUITE 4: OPERATIONAL CONTROLS & PERFORMANCE
// ================================================================================================

#[cfg(test)]
mod operational_tests {
    use super::*;

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let cb = breaker(5, 60_000);
        cb.force_open().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
        assert!(!cb.can_proceed().await);

        cb.reset().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);
        assert!(cb.can_proceed().await);

        let metrics = cb.get_metrics().await;
        assert_eq!(metrics.rejected_requests, 0);
        assert_eq!(metrics.circuit_opened_count, 0);
        assert_eq!(cb.name(), "chat");
    }

    #[tokio::test]
    async fn test_closed_admission_overhead() {
        println!("⚡ TEST: admission overhead while closed");
        let cb = breaker(5, 60_000);
        let iterations = 10_000;

        let started = Instant::now();
        for _ in 0..iterations {
            assert!(cb.can_proceed().await);
            cb.record_success().await;
        }
        let per_call = started.elapsed() / iterations;
        println!("📊 {per_call:?} per admission + report");
        assert!(per_call < Duration::from_millis(1));
    }
}
