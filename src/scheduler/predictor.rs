//! Demand Predictor: a rolling history of admitted caller classes, used to stage
//! the model most likely to be needed next while the generation queue is quiet.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{GenerationPool, ModelType, PoolKind};
use crate::scheduler::queue::PriorityQueue;
use crate::scheduler::request::{CallerClass, GenerationJob};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub interval_secs: u64,
    /// Only samples this recent are counted.
    pub window_secs: u64,
    pub max_samples: usize,
    /// Preloading only happens while the generation queue is shallower than this.
    pub low_load_threshold: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            window_secs: 300,
            max_samples: 1024,
            low_load_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandSample {
    pub caller: CallerClass,
    pub at: Instant,
}

#[derive(Debug)]
pub struct DemandPredictor {
    config: PredictorConfig,
    samples: StdMutex<VecDeque<DemandSample>>,
}

impl DemandPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            samples: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, caller: CallerClass) {
        self.record_at(caller, Instant::now());
    }

    pub fn record_at(&self, caller: CallerClass, at: Instant) {
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() >= self.config.max_samples.max(1) {
                samples.pop_front();
            }
            samples.push_back(DemandSample { caller, at });
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Generation model type with the most requests inside the window. Ties go to
    /// the class requested most recently.
    pub fn predict(&self, now: Instant) -> Option<ModelType> {
        let window = Duration::from_secs(self.config.window_secs);
        let samples = self.samples.lock().ok()?;

        // (count, latest sample)
        let mut demand: HashMap<CallerClass, (usize, Instant)> = HashMap::new();
        for sample in samples.iter() {
            if now.saturating_duration_since(sample.at) > window {
                continue;
            }
            if sample.caller.model_type().pool() != PoolKind::Generation {
                continue;
            }
            let entry = demand.entry(sample.caller).or_insert((0, sample.at));
            entry.0 += 1;
            entry.1 = entry.1.max(sample.at);
        }

        demand
            .into_iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(a.1 .1.cmp(&b.1 .1)))
            .map(|(caller, _)| caller.model_type())
    }

    /// One predictor tick. Returns the model type that was staged, if any.
    pub async fn advise(&self, pool: &GenerationPool, queue_depth: usize) -> Option<ModelType> {
        let predicted = self.predict(Instant::now())?;
        if pool.resident_type() == Some(predicted) || pool.standby_type() == Some(predicted) {
            return None;
        }
        if queue_depth >= self.config.low_load_threshold {
            debug!(%predicted, queue_depth, "Generation queue busy, not preloading");
            return None;
        }

        match pool.preload(predicted).await {
            Ok(true) => {
                info!(%predicted, "Preloaded predicted model");
                Some(predicted)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(%predicted, error = %e, "Preload request rejected");
                None
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        pool: Arc<GenerationPool>,
        queue: Arc<PriorityQueue<GenerationJob>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; there is no history yet
        ticker.tick().await;

        info!(interval_secs = self.config.interval_secs, "Demand predictor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.advise(&pool, queue.len()).await;
                }
            }
        }
        info!("Demand predictor stopped");
    }
}
