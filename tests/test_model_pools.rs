// ================================================================================================
// MODEL POOL LIFECYCLE TEST SUITE
// ================================================================================================
//
// Drives the generation and embedding pools directly over the simulated engine:
// - swap planning: overlapped when both models fit, sequential otherwise
// - idempotent ensure_loaded and the one-resident-instance rule
// - load failures, pool faults and explicit reset
// - standby preloading and promotion
//
// Memory is expressed in GB-sized units of 1024MB.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use ai_inference_scheduler::config::{MemoryConfig, ModelCatalog, ModelConfig};
use ai_inference_scheduler::models::{
    ChunkSink, EmbeddingOutcome, EmbeddingPool, EngineError, EngineEvent, GenerationParams, GenerationPool,
    ModelState, ModelType, SimulatedEngine, SwapKind,
};
use ai_inference_scheduler::resources::{AccountingProbe, ResourceMonitor};
use ai_inference_scheduler::scheduler::request::GenerationEvent;
use ai_inference_scheduler::Error;

const GB: u64 = 1024;

fn catalog() -> ModelCatalog {
    ModelCatalog::new([
        ModelConfig::new(ModelType::Chat, "chat.gguf", 18 * GB),
        ModelConfig::new(ModelType::Summary, "summary.gguf", 8 * GB),
        ModelConfig::new(ModelType::Embedding, "embedding.gguf", 512),
    ])
}

struct Harness {
    probe: Arc<AccountingProbe>,
    engine: Arc<SimulatedEngine>,
    monitor: Arc<ResourceMonitor>,
}

impl Harness {
    fn new(capacity_gb: u64, configure: impl FnOnce(SimulatedEngine) -> SimulatedEngine) -> Self {
        let probe = Arc::new(AccountingProbe::new(capacity_gb * GB));
        let engine = Arc::new(configure(SimulatedEngine::new(probe.clone())));
        let monitor = Arc::new(ResourceMonitor::new(
            probe.clone(),
            &MemoryConfig {
                ceiling_mb: capacity_gb * GB,
                safety_margin_mb: GB,
            },
        ));
        Self { probe, engine, monitor }
    }

    fn generation_pool(&self) -> Arc<GenerationPool> {
        Arc::new(GenerationPool::new(self.engine.clone(), self.monitor.clone(), catalog()))
    }

    fn embedding_pool(&self, enabled: bool) -> EmbeddingPool {
        EmbeddingPool::new(self.engine.clone(), self.monitor.clone(), catalog(), enabled)
    }

    fn position(&self, wanted: impl Fn(&EngineEvent) -> bool) -> usize {
        self.engine
            .events()
            .iter()
            .position(wanted)
            .expect("event not recorded")
    }
}

fn sink() -> (ChunkSink, mpsc::Receiver<GenerationEvent>) {
    let (tx, rx) = mpsc::channel(256);
    (ChunkSink::new(tx), rx)
}

#[cfg(test)]
mod swap_planning_tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_swap_when_both_do_not_fit() {
        println!("🔄 TEST: 18 + 8 + 1 > 24 forces a sequential swap");
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();

        let first = pool.ensure_loaded(ModelType::Chat).await.unwrap();
        assert_eq!(first.kind, SwapKind::ColdLoad);

        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::Sequential);
        assert_eq!(swap.previous, Some(ModelType::Chat));
        assert_eq!(pool.resident_type(), Some(ModelType::Summary));

        let chat_gone = h.position(|e| matches!(e, EngineEvent::UnloadFinished { model_type: ModelType::Chat, .. }));
        let summary_starts =
            h.position(|e| matches!(e, EngineEvent::LoadStarted { model_type: ModelType::Summary, .. }));
        assert!(chat_gone < summary_starts, "chat must be torn down before summary loads");
        assert_eq!(h.probe.used_mb(), 8 * GB);
        println!("✅ Sequential swap verified");
    }

    #[tokio::test]
    async fn test_overlapped_swap_keeps_old_model_serving() {
        println!("🔄 TEST: 18 + 8 + 1 <= 30 allows an overlapped swap");
        let h = Harness::new(30, |e| e.with_load_delay(Duration::from_millis(150)));
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        let swapping = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.ensure_loaded(ModelType::Summary).await })
        };
        sleep(Duration::from_millis(50)).await;

        // mid-load: chat is still resident and still answers
        assert_eq!(pool.resident_type(), Some(ModelType::Chat));
        let (mut sink, _rx) = sink();
        let (_, stats) = pool
            .generate(ModelType::Chat, "still here", &GenerationParams::default(), &mut sink)
            .await
            .unwrap();
        assert!(stats.tokens_generated > 0);

        let swap = swapping.await.unwrap().unwrap();
        assert_eq!(swap.kind, SwapKind::Overlapped);
        assert_eq!(pool.resident_type(), Some(ModelType::Summary));

        let summary_ready =
            h.position(|e| matches!(e, EngineEvent::LoadFinished { model_type: ModelType::Summary, .. }));
        let chat_gone = h.position(|e| matches!(e, EngineEvent::UnloadFinished { model_type: ModelType::Chat, .. }));
        assert!(summary_ready < chat_gone, "old model must outlive the new model's load");
        assert_eq!(h.probe.used_mb(), 8 * GB);
        assert_eq!(h.engine.live_instances(), 1);
        println!("✅ Overlapped swap verified");
    }

    #[tokio::test]
    async fn test_in_flight_generation_finishes_on_old_instance() {
        println!("🔄 TEST: teardown waits for in-flight work on the superseded instance");
        let h = Harness::new(30, |e| e.with_token_delay(Duration::from_millis(20)));
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        let generating = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let (mut sink, _rx) = sink();
                pool.generate(ModelType::Chat, "one two three four five six", &GenerationParams::default(), &mut sink)
                    .await
            })
        };
        sleep(Duration::from_millis(30)).await;

        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::Overlapped);

        let (_, stats) = generating.await.unwrap().unwrap();
        // "[chat]" plus six words
        assert_eq!(stats.tokens_generated, 7);
        assert_eq!(h.engine.live_instances(), 1);
        println!("✅ In-flight generation completed before teardown");
    }

    #[tokio::test]
    async fn test_unreadable_probe_falls_back_to_sequential() {
        println!("🔄 TEST: no memory reading means the conservative path");
        let h = Harness::new(30, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        h.probe.set_unreachable(true);
        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::Sequential);
        println!("✅ Sequential fallback verified");
    }

    #[tokio::test]
    async fn test_insufficient_resources_leaves_pool_usable() {
        println!("🔄 TEST: a model that cannot fit is refused without faulting the pool");
        let h = Harness::new(24, |e| e);
        h.probe.allocate(10 * GB); // another tenant on the device
        let pool = h.generation_pool();

        let err = pool.ensure_loaded(ModelType::Chat).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
        assert_eq!(pool.state(), ModelState::Idle);
        assert_eq!(h.engine.load_count(ModelType::Chat), 0);

        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::ColdLoad);
        println!("✅ Refusal verified");
    }
}

#[cfg(test)]
mod residency_tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        println!("📌 TEST: repeated ensure_loaded performs one load");
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();

        pool.ensure_loaded(ModelType::Chat).await.unwrap();
        let again = pool.ensure_loaded(ModelType::Chat).await.unwrap();
        assert_eq!(again.kind, SwapKind::AlreadyResident);
        assert_eq!(h.engine.load_count(ModelType::Chat), 1);
        assert_eq!(pool.status().metrics.total_swaps, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_loaded_loads_once() {
        println!("📌 TEST: concurrent callers share one load");
        let h = Harness::new(24, |e| e.with_load_delay(Duration::from_millis(50)));
        let pool = h.generation_pool();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.ensure_loaded(ModelType::Summary).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(h.engine.load_count(ModelType::Summary), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_more_than_one_instance_when_memory_is_tight() {
        println!("📌 TEST: alternating demand never holds two generation models at once");
        let h = Harness::new(24, |e| e.with_load_delay(Duration::from_millis(5)));
        let pool = h.generation_pool();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let pool = pool.clone();
                let model_type = if i % 2 == 0 { ModelType::Chat } else { ModelType::Summary };
                tokio::spawn(async move { pool.ensure_loaded(model_type).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut live = 0i32;
        let mut peak = 0i32;
        for event in h.engine.events() {
            match event {
                EngineEvent::LoadFinished { .. } => live += 1,
                EngineEvent::UnloadFinished { .. } => live -= 1,
                _ => {}
            }
            peak = peak.max(live);
        }
        assert_eq!(peak, 1);
        assert!(h.probe.used_mb() <= 24 * GB);
    }

    #[tokio::test]
    async fn test_generate_requires_matching_resident_model() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        let (mut sink, _rx) = sink();

        let err = pool
            .generate(ModelType::Chat, "hi", &GenerationParams::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotResident(_)));

        pool.ensure_loaded(ModelType::Summary).await.unwrap();
        let err = pool
            .generate(ModelType::Chat, "hi", &GenerationParams::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotResident(_)));
    }

    #[tokio::test]
    async fn test_generation_pool_refuses_embedding_models() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        let err = pool.ensure_loaded(ModelType::Embedding).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

#[cfg(test)]
mod fault_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_load_faults_pool_until_reset() {
        println!("💥 TEST: a failed load parks the pool in Error");
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        h.engine.fail_loads(ModelType::Summary, true);

        let err = pool.ensure_loaded(ModelType::Summary).await.unwrap_err();
        assert!(matches!(err, Error::LoadFailure(_)));
        assert_eq!(pool.state(), ModelState::Error);

        // no silent retry while faulted
        let err = pool.ensure_loaded(ModelType::Chat).await.unwrap_err();
        assert!(matches!(err, Error::PoolFaulted(_)));
        assert_eq!(h.engine.load_count(ModelType::Chat), 0);

        assert!(pool.reset());
        assert_eq!(pool.state(), ModelState::Idle);
        h.engine.fail_loads(ModelType::Summary, false);
        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::ColdLoad);
        assert_eq!(pool.status().metrics.failed_loads, 1);
        println!("✅ Fault and reset verified");
    }

    #[tokio::test]
    async fn test_engine_fault_keeps_instance_loaded() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();
        h.engine.fail_generations(Some(EngineError::Fault("bad sampling".into())));

        let (mut sink, _rx) = sink();
        let err = pool
            .generate(ModelType::Chat, "hello", &GenerationParams::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationFailure(_)));
        assert_eq!(pool.state(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_unusable_instance_is_replaced_on_next_demand() {
        println!("💥 TEST: an unusable instance is swapped out, not reused");
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();
        h.engine.fail_generations(Some(EngineError::Unusable("device lost".into())));

        let (mut sink, _rx) = sink();
        let err = pool
            .generate(ModelType::Chat, "hello", &GenerationParams::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationFailure(_)));
        assert_eq!(pool.state(), ModelState::Error);

        h.engine.fail_generations(None);
        let swap = pool.ensure_loaded(ModelType::Chat).await.unwrap();
        assert!(swap.performed_load());
        assert_eq!(pool.state(), ModelState::Loaded);
        assert_eq!(h.engine.load_count(ModelType::Chat), 2);
        assert_eq!(h.engine.live_instances(), 1);
        println!("✅ Replacement verified");
    }

    #[tokio::test]
    async fn test_force_unload_clears_fault_and_memory() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        assert_eq!(pool.force_unload().await, Some(ModelType::Chat));
        assert_eq!(pool.state(), ModelState::Idle);
        assert_eq!(h.probe.used_mb(), 0);
    }

    #[tokio::test]
    async fn test_force_reload_replaces_matching_model() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        let first = pool.ensure_loaded(ModelType::Chat).await.unwrap();

        let reload = pool.force_reload(ModelType::Chat).await.unwrap();
        assert_eq!(reload.kind, SwapKind::Sequential);
        assert_ne!(reload.instance_id, first.instance_id);
        assert_eq!(h.engine.load_count(ModelType::Chat), 2);
    }
}

#[cfg(test)]
mod preload_tests {
    use super::*;

    #[tokio::test]
    async fn test_preload_stages_standby_and_promotes_it() {
        println!("⏩ TEST: preload next to the resident model, promote on demand");
        let h = Harness::new(30, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        assert!(pool.preload(ModelType::Summary).await.unwrap());
        assert_eq!(pool.resident_type(), Some(ModelType::Chat));
        assert_eq!(pool.standby_type(), Some(ModelType::Summary));

        let swap = pool.ensure_loaded(ModelType::Summary).await.unwrap();
        assert_eq!(swap.kind, SwapKind::PromotedStandby);
        assert_eq!(h.engine.load_count(ModelType::Summary), 1);
        assert_eq!(pool.standby_type(), None);
        assert_eq!(h.engine.live_instances(), 1);
        println!("✅ Standby promotion verified");
    }

    #[tokio::test]
    async fn test_preload_never_evicts() {
        let h = Harness::new(24, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();

        assert!(!pool.preload(ModelType::Summary).await.unwrap());
        assert_eq!(pool.resident_type(), Some(ModelType::Chat));
        assert_eq!(h.engine.load_count(ModelType::Summary), 0);
    }

    #[tokio::test]
    async fn test_failed_preload_does_not_fault_pool() {
        let h = Harness::new(30, |e| e);
        let pool = h.generation_pool();
        pool.ensure_loaded(ModelType::Chat).await.unwrap();
        h.engine.fail_loads(ModelType::Summary, true);

        assert!(!pool.preload(ModelType::Summary).await.unwrap());
        assert_eq!(pool.state(), ModelState::Loaded);
        assert_eq!(pool.status().metrics.failed_loads, 1);
    }
}

#[cfg(test)]
mod embedding_pool_tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_returns_one_vector_per_text() {
        let h = Harness::new(24, |e| e);
        let pool = h.embedding_pool(true);
        pool.start().await.unwrap();

        let texts: Vec<String> = ["blacksmith", "innkeeper", "guard"].iter().map(|s| s.to_string()).collect();
        let vectors = pool.embed(&texts).await.unwrap().into_vectors().unwrap();
        assert_eq!(vectors.len(), 3);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn test_empty_input_is_an_error() {
        let h = Harness::new(24, |e| e);
        let pool = h.embedding_pool(true);
        pool.start().await.unwrap();
        assert!(matches!(pool.embed(&[]).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_disabled_pool_reports_disabled() {
        let h = Harness::new(24, |e| e);
        let pool = h.embedding_pool(false);
        assert!(pool.start().await.unwrap().is_none());

        let outcome = pool.embed(&["anything".to_string()]).await.unwrap();
        assert_eq!(outcome, EmbeddingOutcome::Disabled);
        assert_eq!(h.engine.load_count(ModelType::Embedding), 0);
    }
}
