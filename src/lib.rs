//! Offline sync core for field-operations apps.
//!
//! Two subsystems share this crate:
//!
//! * the outbox: a durable queue of create/update/delete mutations with
//!   coalescing, a cross-session processing lock and retry with backoff;
//! * cache warming: bounded-concurrency, TTL-aware prefetch into the local
//!   read cache, optionally chained into dependency-ordered phases.
//!
//! [`SyncEngine`] wires the pieces together for hosts that do not need to
//! assemble them by hand.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod network;
pub mod outbox;
pub mod pool;
pub mod prefetch;
pub mod processor;
pub mod registry;
pub mod store;
pub mod trigger;
pub mod warm;

use std::sync::Arc;

use tracing::info;

pub use cache::{fetch_fn, CachedEntry, FetchFn, MemoryQueryCache, QueryCache, QueryKey};
pub use clock::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use coalesce::{CoalesceAction, EnqueueOutcome};
pub use config::{OutboxConfig, PrefetchConfig, SyncConfig, TriggerConfig};
pub use error::{
    ConfigError, DispatchError, ErrorCategory, FetchError, OutboxError, StoreError,
};
pub use lock::{Lease, ProcessingLock, ProcessingSession, SessionId};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use model::{GenericPayload, ItemStatus, OutboxItem, OutboxOp, Uid};
pub use network::{Connectivity, ConnectivityFlag};
pub use outbox::{Outbox, QueueDepthSnapshot};
pub use pool::{PoolReport, PoolTask};
pub use prefetch::{PrefetchJob, PrefetchOrchestrator, PrefetchReport};
pub use processor::{DrainOutcome, QueueProcessor};
pub use registry::{EntityRegistry, EntityService, ListOptions};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use store::{MemoryStore, PersistedState, QueueStore};
pub use trigger::{AppLifecycle, SyncTrigger, TriggerEvent, TriggerHandle};
pub use warm::{PhaseSource, PhaseStatus, WarmPhase, WarmPipeline};

/// A lock record older than this may be taken over by another session.
pub const LOCK_STALE_MS: u64 = 120_000;
/// An entry left `in_progress` this long is assumed orphaned and requeued.
pub const STUCK_THRESHOLD_MS: u64 = 180_000;
/// Backoff after the first failed attempt; doubles with each further one.
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
/// Upper bound on the backoff between two dispatches.
pub const MAX_RETRY_DELAY_MS: u64 = 60000;

/// `min(max_ms, base_ms * 2^attempt)`, saturating.
#[must_use]
pub fn calculate_retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    exponential.min(max_ms)
}

// ============================================================================
// Engine
// ============================================================================

/// Fully wired sync core.
pub struct SyncEngine {
    outbox: Arc<Outbox>,
    processor: Arc<QueueProcessor>,
    prefetch: PrefetchOrchestrator,
    cache: Arc<dyn QueryCache>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
}

impl SyncEngine {
    pub fn builder(store: Arc<dyn QueueStore>, registry: EntityRegistry) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            registry,
            cache: None,
            connectivity: None,
            clock: None,
            config: SyncConfig::default(),
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    pub fn prefetcher(&self) -> &PrefetchOrchestrator {
        &self.prefetch
    }

    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Event-driven drain loop; pair with [`SyncTrigger::channel`].
    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger::new(
            self.processor.clone(),
            self.connectivity.clone(),
            self.config.trigger.clone(),
        )
    }

    /// Empty warm pipeline sharing this engine's cache and connectivity.
    pub fn warm_pipeline(&self) -> WarmPipeline {
        WarmPipeline::new(
            self.cache.clone(),
            self.connectivity.clone(),
            &self.config.prefetch,
            self.metrics.clone(),
        )
    }
}

pub struct SyncEngineBuilder {
    store: Arc<dyn QueueStore>,
    registry: EntityRegistry,
    cache: Option<Arc<dyn QueryCache>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    clock: Option<Arc<dyn Clock>>,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the config and initializes the store.
    pub async fn build(self) -> Result<SyncEngine, OutboxError> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let cache: Arc<dyn QueryCache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryQueryCache::new(
                MemoryQueryCache::DEFAULT_CAPACITY,
                clock.clone(),
            )),
        };
        let connectivity: Arc<dyn Connectivity> = match self.connectivity {
            Some(connectivity) => connectivity,
            None => Arc::new(ConnectivityFlag::default()),
        };
        let metrics = Arc::new(SyncMetrics::new());

        let state = Arc::new(PersistedState::new(self.store));
        state.init().await?;

        let outbox = Arc::new(Outbox::new(
            state.clone(),
            Arc::new(self.registry),
            clock.clone(),
            self.config.outbox.clone(),
            metrics.clone(),
        )?);
        let lock = ProcessingLock::new(state, clock, self.config.outbox.lock_stale_ms);
        let processor = Arc::new(QueueProcessor::new(
            outbox.clone(),
            lock,
            cache.clone(),
            metrics.clone(),
        ));
        let prefetch = PrefetchOrchestrator::new(
            cache.clone(),
            connectivity.clone(),
            self.config.prefetch.clone(),
            metrics.clone(),
        );

        info!(
            entities = outbox.registry().entities().count(),
            "Sync engine ready"
        );
        Ok(SyncEngine {
            outbox,
            processor,
            prefetch,
            cache,
            connectivity,
            config: self.config,
            metrics,
        })
    }
}
