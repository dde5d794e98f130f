//! Swap machinery shared by the generation and embedding pools.
//!
//! Every load or unload runs under the pool's swap lock. The resident pointer is a
//! short-lived std lock that is never held across an await, so readers (status,
//! generate) are never blocked behind a slow load.

use std::sync::{Arc, Mutex as StdMutex, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ModelCatalog, ModelConfig};
use crate::error::{Error, Result};
use crate::models::atomic_swap::{SwapContext, SwapKind, SwapMetrics, SwapOutcome};
use crate::models::instance::{InstanceSnapshot, ModelInstance};
use crate::models::state::ModelState;
use crate::models::traits::InferenceEngine;
use crate::models::{ModelType, PoolKind};
use crate::resources::{ResourceMonitor, SwapStrategy};

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub kind: PoolKind,
    pub state: ModelState,
    pub resident: Option<InstanceSnapshot>,
    pub standby: Option<InstanceSnapshot>,
    pub incoming: Option<ModelType>,
    pub fault: Option<String>,
    pub metrics: SwapMetrics,
}

pub struct PoolCore {
    kind: PoolKind,
    engine: Arc<dyn InferenceEngine>,
    monitor: Arc<ResourceMonitor>,
    catalog: ModelCatalog,
    swap_lock: Mutex<()>,
    current: RwLock<Option<Arc<ModelInstance>>>,
    standby: StdMutex<Option<Arc<ModelInstance>>>,
    incoming: StdMutex<Option<Arc<ModelInstance>>>,
    outgoing: StdMutex<Option<Arc<ModelInstance>>>,
    fault: StdMutex<Option<String>>,
    metrics: StdMutex<SwapMetrics>,
}

impl std::fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolCore({}, resident={:?})", self.kind, self.resident_type())
    }
}

fn slot_get(slot: &StdMutex<Option<Arc<ModelInstance>>>) -> Option<Arc<ModelInstance>> {
    slot.lock().ok().and_then(|s| s.clone())
}

fn slot_set(slot: &StdMutex<Option<Arc<ModelInstance>>>, value: Option<Arc<ModelInstance>>) {
    if let Ok(mut s) = slot.lock() {
        *s = value;
    }
}

impl PoolCore {
    pub fn new(
        kind: PoolKind,
        engine: Arc<dyn InferenceEngine>,
        monitor: Arc<ResourceMonitor>,
        catalog: ModelCatalog,
    ) -> Self {
        Self {
            kind,
            engine,
            monitor,
            catalog,
            swap_lock: Mutex::new(()),
            current: RwLock::new(None),
            standby: StdMutex::new(None),
            incoming: StdMutex::new(None),
            outgoing: StdMutex::new(None),
            fault: StdMutex::new(None),
            metrics: StdMutex::new(SwapMetrics::default()),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn resident(&self) -> Option<Arc<ModelInstance>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    pub fn resident_type(&self) -> Option<ModelType> {
        self.resident().map(|i| i.model_type())
    }

    pub fn standby_type(&self) -> Option<ModelType> {
        slot_get(&self.standby).map(|i| i.model_type())
    }

    /// Resident instance of `model_type` that can accept work.
    pub fn serving(&self, model_type: ModelType) -> Option<Arc<ModelInstance>> {
        self.resident()
            .filter(|i| i.model_type() == model_type && i.is_serving())
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|f| f.clone())
    }

    pub fn state(&self) -> ModelState {
        if self.fault().is_some() {
            return ModelState::Error;
        }
        if let Some(resident) = self.resident() {
            return resident.state();
        }
        if slot_get(&self.incoming).is_some() {
            return ModelState::Loading;
        }
        if slot_get(&self.outgoing).is_some() {
            return ModelState::Unloading;
        }
        ModelState::Idle
    }

    pub fn metrics(&self) -> SwapMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            kind: self.kind,
            state: self.state(),
            resident: self.resident().map(|i| i.snapshot()),
            standby: slot_get(&self.standby).map(|i| i.snapshot()),
            incoming: slot_get(&self.incoming).map(|i| i.model_type()),
            fault: self.fault(),
            metrics: self.metrics(),
        }
    }

    fn check_accepts(&self, model_type: ModelType) -> Result<()> {
        if self.kind.accepts(model_type) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("{} pool cannot hold a {model_type} model", self.kind)))
        }
    }

    fn config_for(&self, model_type: ModelType) -> Result<ModelConfig> {
        self.catalog.require(model_type).cloned()
    }

    /// No-op when `model_type` is already resident, otherwise swaps it in.
    pub async fn ensure_loaded(&self, model_type: ModelType) -> Result<SwapOutcome> {
        self.check_accepts(model_type)?;
        let ctx = SwapContext::new(model_type, "demand");

        if let Some(instance) = self.serving(model_type) {
            return Ok(ctx.finish(SwapKind::AlreadyResident, Some(model_type), instance.id()));
        }

        let _swap = self.swap_lock.lock().await;
        // another caller may have finished the same swap while we waited
        if let Some(instance) = self.serving(model_type) {
            return Ok(ctx.finish(SwapKind::AlreadyResident, Some(model_type), instance.id()));
        }
        self.replace_locked(ctx).await
    }

    /// Administrative reload: clears a fault and replaces the resident instance even
    /// if it already matches. Still consults the resource monitor.
    pub async fn reload(&self, model_type: ModelType) -> Result<SwapOutcome> {
        self.check_accepts(model_type)?;
        let _swap = self.swap_lock.lock().await;
        self.clear_fault("forced reload");
        self.replace_locked(SwapContext::new(model_type, "forced reload")).await
    }

    async fn replace_locked(&self, ctx: SwapContext) -> Result<SwapOutcome> {
        if let Some(fault) = self.fault() {
            return Err(Error::PoolFaulted(format!("{} ({fault})", self.kind)));
        }
        let config = self.config_for(ctx.target)?;
        let previous = self.resident();
        let previous_type = previous.as_ref().map(|i| i.model_type());

        info!(
            pool = %self.kind,
            operation_id = %ctx.operation_id,
            reason = ctx.reason,
            from = ?previous_type,
            to = %ctx.target,
            "Starting model swap"
        );

        let standby = self.standby.lock().ok().and_then(|mut s| s.take());
        if let Some(standby) = standby {
            if standby.model_type() == ctx.target && standby.is_serving() {
                self.swap_pointer(previous.as_ref(), Some(standby.clone()))?;
                if let Some(old) = previous {
                    self.retire(old).await;
                }
                return Ok(self.finish(&ctx, SwapKind::PromotedStandby, previous_type, standby.id()));
            }
            debug!(pool = %self.kind, stale = %standby.model_type(), "Discarding stale standby");
            self.retire(standby).await;
        }

        let Some(old) = previous else {
            self.monitor.ensure_fits_after_release(&config, 0)?;
            let instance = self.load(config, true).await?;
            self.swap_pointer(None, Some(instance.clone()))?;
            return Ok(self.finish(&ctx, SwapKind::ColdLoad, None, instance.id()));
        };

        match self.monitor.plan_swap(&config) {
            SwapStrategy::Overlapped => {
                // old instance keeps serving until the new one is ready
                let instance = self.load(config, true).await?;
                self.swap_pointer(Some(&old), Some(instance.clone()))?;
                self.retire(old).await;
                Ok(self.finish(&ctx, SwapKind::Overlapped, previous_type, instance.id()))
            }
            SwapStrategy::Sequential => {
                self.monitor.ensure_fits_after_release(&config, old.memory_mb())?;
                self.swap_pointer(Some(&old), None)?;
                self.retire(old).await;
                self.monitor.ensure_fits_after_release(&config, 0)?;
                let instance = self.load(config, true).await?;
                self.swap_pointer(None, Some(instance.clone()))?;
                Ok(self.finish(&ctx, SwapKind::Sequential, previous_type, instance.id()))
            }
        }
    }

    fn finish(&self, ctx: &SwapContext, kind: SwapKind, previous: Option<ModelType>, instance_id: uuid::Uuid) -> SwapOutcome {
        let outcome = ctx.finish(kind, previous, instance_id);
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record(&outcome);
        }
        info!(
            pool = %self.kind,
            operation_id = %ctx.operation_id,
            kind = ?outcome.kind,
            duration_ms = outcome.duration_ms,
            "Model swap completed"
        );
        outcome
    }

    /// Compare-and-set of the resident pointer against the instance the swap began from.
    fn swap_pointer(&self, expected: Option<&Arc<ModelInstance>>, next: Option<Arc<ModelInstance>>) -> Result<()> {
        let mut current = self
            .current
            .write()
            .map_err(|_| Error::InvalidTransition("resident pointer lock poisoned".into()))?;

        let matches = match (current.as_ref(), expected) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if !matches {
            return Err(Error::InvalidTransition(format!(
                "{} pool resident pointer changed during swap",
                self.kind
            )));
        }
        *current = next;
        Ok(())
    }

    async fn load(&self, config: ModelConfig, fault_on_error: bool) -> Result<Arc<ModelInstance>> {
        let model_type = config.model_type;
        let instance = Arc::new(ModelInstance::loading(config.clone()));
        slot_set(&self.incoming, Some(instance.clone()));

        let result = self.engine.load(&config).await;
        slot_set(&self.incoming, None);

        match result {
            Ok(model) => {
                self.monitor.record_footprint(model_type, model.memory_mb());
                instance.attach(model).await?;
                self.monitor.hold(instance.id(), instance.memory_mb());
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.loads += 1;
                }
                info!(
                    pool = %self.kind,
                    %model_type,
                    instance_id = %instance.id(),
                    memory_mb = instance.memory_mb(),
                    "Model loaded"
                );
                Ok(instance)
            }
            Err(e) => {
                instance.mark_failed();
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.failed_loads += 1;
                }
                if fault_on_error {
                    if let Ok(mut fault) = self.fault.lock() {
                        *fault = Some(e.to_string());
                    }
                }
                error!(pool = %self.kind, %model_type, error = %e, "Model load failed");
                Err(Error::LoadFailure(format!("{model_type} from '{}': {e}", config.path)))
            }
        }
    }

    async fn retire(&self, instance: Arc<ModelInstance>) {
        slot_set(&self.outgoing, Some(instance.clone()));
        match instance.teardown().await {
            Ok(memory_mb) => {
                self.monitor.release(instance.id());
                if let Ok(mut metrics) = self.metrics.lock() {
                    metrics.unloads += 1;
                }
                debug!(pool = %self.kind, instance_id = %instance.id(), memory_mb, "Instance retired");
            }
            Err(e) => error!(pool = %self.kind, instance_id = %instance.id(), error = %e, "Teardown failed"),
        }
        slot_set(&self.outgoing, None);
    }

    /// Best-effort speculative load next to the resident model. Never evicts
    /// anything; returns whether a standby instance was staged.
    pub async fn preload(&self, model_type: ModelType) -> Result<bool> {
        self.check_accepts(model_type)?;
        if self.resident_type() == Some(model_type) || self.standby_type() == Some(model_type) {
            return Ok(false);
        }

        let Ok(_swap) = self.swap_lock.try_lock() else {
            debug!(pool = %self.kind, %model_type, "Swap in progress, skipping preload");
            return Ok(false);
        };
        if self.fault().is_some() || self.standby_type().is_some() {
            return Ok(false);
        }

        let config = self.config_for(model_type)?;
        if !self.monitor.fits_alongside(&config) {
            debug!(pool = %self.kind, %model_type, "Preload does not fit next to resident model");
            return Ok(false);
        }

        match self.load(config, false).await {
            Ok(instance) => {
                info!(pool = %self.kind, %model_type, instance_id = %instance.id(), "Standby instance preloaded");
                slot_set(&self.standby, Some(instance));
                Ok(true)
            }
            Err(e) => {
                warn!(pool = %self.kind, %model_type, error = %e, "Preload failed, ignoring");
                Ok(false)
            }
        }
    }

    /// Tears down resident and standby instances and clears any fault.
    pub async fn unload_all(&self) -> Option<ModelType> {
        let _swap = self.swap_lock.lock().await;
        let previous = self.current.write().ok().and_then(|mut c| c.take());
        let standby = self.standby.lock().ok().and_then(|mut s| s.take());
        let previous_type = previous.as_ref().map(|i| i.model_type());

        for instance in previous.into_iter().chain(standby) {
            self.retire(instance).await;
        }
        self.clear_fault("forced unload");
        info!(pool = %self.kind, previous = ?previous_type, "Pool unloaded");
        previous_type
    }

    /// Clears `Error` back to `Idle`. Returns whether the pool was faulted.
    pub fn reset(&self) -> bool {
        self.clear_fault("reset")
    }

    fn clear_fault(&self, reason: &str) -> bool {
        let cleared = self.fault.lock().ok().and_then(|mut f| f.take());
        if let Some(fault) = &cleared {
            info!(pool = %self.kind, %fault, reason, "Pool fault cleared");
        }
        cleared.is_some()
    }
}
