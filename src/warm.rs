//! Dependency-ordered cache warming.
//!
//! A pipeline is a list of phases run strictly one after another. Phase N+1
//! is only enabled once phase N reports `done`; work inside a phase fans out
//! through the bounded pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cache::{fetch_fn, needs_fetch, QueryCache, QueryKey};
use crate::config::PrefetchConfig;
use crate::error::FetchError;
use crate::metrics::SyncMetrics;
use crate::network::Connectivity;
use crate::pool::{self, PoolReport, PoolTask};
use crate::registry::server_id_of;

pub type IdExtractor = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(&str) -> QueryKey + Send + Sync>;
pub type IdFetchFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

pub fn id_fetch_fn<F, Fut>(f: F) -> IdFetchFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move |id| f(id).boxed())
}

/// Where a phase finds the records whose ids it warms.
#[derive(Clone, Debug)]
pub enum PhaseSource {
    Items(Vec<Value>),
    /// Read from the cache when the phase starts, so it can consume what an
    /// earlier phase populated.
    CachedList(QueryKey),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub running: bool,
    pub done: bool,
    pub queued: usize,
}

impl PhaseStatus {
    const fn resolved(queued: usize) -> Self {
        Self {
            running: false,
            done: true,
            queued,
        }
    }
}

pub struct WarmPhase {
    name: String,
    source: PhaseSource,
    id_of: IdExtractor,
    key_of: KeyFn,
    fetch: IdFetchFn,
    ttl: Option<Duration>,
    enabled: bool,
}

impl WarmPhase {
    /// Ids are read from each record's `id` field unless overridden.
    pub fn new<K>(name: impl Into<String>, source: PhaseSource, key_of: K, fetch: IdFetchFn) -> Self
    where
        K: Fn(&str) -> QueryKey + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source,
            id_of: Arc::new(server_id_of),
            key_of: Arc::new(key_of),
            fetch,
            ttl: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_id_of<F>(mut self, id_of: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.id_of = Arc::new(id_of);
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WarmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmPhase")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// A warm target: record id plus the cache key it lands under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarmTarget {
    pub id: String,
    pub key: QueryKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseStatus,
    pub pool: PoolReport,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub phases: Vec<PhaseReport>,
    pub cancelled: bool,
}

pub struct WarmPipeline {
    cache: Arc<dyn QueryCache>,
    connectivity: Arc<dyn Connectivity>,
    concurrency: usize,
    default_ttl: Option<Duration>,
    metrics: Arc<SyncMetrics>,
    phases: Vec<WarmPhase>,
    statuses: Vec<watch::Sender<PhaseStatus>>,
}

impl WarmPipeline {
    pub fn new(
        cache: Arc<dyn QueryCache>,
        connectivity: Arc<dyn Connectivity>,
        config: &PrefetchConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            cache,
            connectivity,
            concurrency: config.warm_concurrency,
            default_ttl: config.default_ttl(),
            metrics,
            phases: Vec::new(),
            statuses: Vec::new(),
        }
    }

    #[must_use]
    pub fn phase(mut self, phase: WarmPhase) -> Self {
        let (tx, _) = watch::channel(PhaseStatus::default());
        self.phases.push(phase);
        self.statuses.push(tx);
        self
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn status(&self, idx: usize) -> Option<PhaseStatus> {
        self.statuses.get(idx).map(|tx| *tx.borrow())
    }

    pub fn subscribe(&self, idx: usize) -> Option<watch::Receiver<PhaseStatus>> {
        self.statuses.get(idx).map(watch::Sender::subscribe)
    }

    /// A phase's own flag gated on its predecessor being done.
    pub fn is_enabled(&self, idx: usize) -> bool {
        let Some(phase) = self.phases.get(idx) else {
            return false;
        };
        let previous_done = idx == 0 || self.status(idx - 1).is_some_and(|s| s.done);
        phase.enabled && previous_done
    }

    /// Stale or missing targets for a phase, deduplicated by id. Empty while
    /// the phase is not enabled.
    pub async fn targets(&self, idx: usize) -> Vec<WarmTarget> {
        if !self.is_enabled(idx) {
            return Vec::new();
        }
        let phase = &self.phases[idx];
        let records = match &phase.source {
            PhaseSource::Items(items) => items.clone(),
            PhaseSource::CachedList(key) => match self.cache.get_state(key).await {
                Some(entry) => match entry.data {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                },
                None => Vec::new(),
            },
        };

        let ttl = phase.ttl.or(self.default_ttl);
        let now = self.cache.now();
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for record in &records {
            let Some(id) = (phase.id_of)(record) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            let key = (phase.key_of)(&id);
            let entry = self.cache.get_state(&key).await;
            if needs_fetch(entry.as_ref(), ttl, false, now) {
                targets.push(WarmTarget { id, key });
            }
        }
        targets
    }

    /// Run every phase in order. Statuses start from scratch on each call.
    #[instrument(skip_all, fields(phases = self.phases.len()))]
    pub async fn run(&self, cancel: &CancellationToken) -> WarmReport {
        for tx in &self.statuses {
            tx.send_replace(PhaseStatus::default());
        }
        let online = self.connectivity.is_connected().await;
        let mut report = WarmReport::default();

        for (idx, phase) in self.phases.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let status = &self.statuses[idx];

            if !online || !self.is_enabled(idx) {
                status.send_replace(PhaseStatus::resolved(0));
                debug!(phase = %phase.name, online, "Warm phase resolved without work");
                report.phases.push(PhaseReport {
                    name: phase.name.clone(),
                    status: PhaseStatus::resolved(0),
                    pool: PoolReport::default(),
                });
                continue;
            }

            let targets = self.targets(idx).await;
            let queued = targets.len();
            if queued == 0 {
                status.send_replace(PhaseStatus::resolved(0));
                report.phases.push(PhaseReport {
                    name: phase.name.clone(),
                    status: PhaseStatus::resolved(0),
                    pool: PoolReport::default(),
                });
                continue;
            }

            status.send_replace(PhaseStatus {
                running: true,
                done: false,
                queued,
            });
            let ttl = phase.ttl.or(self.default_ttl);
            let tasks = targets
                .into_iter()
                .map(|target| self.task(phase, target, ttl))
                .collect();
            let outcome = pool::run(tasks, self.concurrency, cancel).await;

            SyncMetrics::add(&self.metrics.prefetched, outcome.succeeded);
            SyncMetrics::add(&self.metrics.prefetch_failures, outcome.failed);

            let finished = if cancel.is_cancelled() {
                PhaseStatus {
                    running: false,
                    done: false,
                    queued,
                }
            } else {
                PhaseStatus::resolved(queued)
            };
            status.send_replace(finished);
            info!(
                phase = %phase.name,
                queued,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Warm phase finished"
            );
            report.phases.push(PhaseReport {
                name: phase.name.clone(),
                status: finished,
                pool: outcome,
            });
        }

        report.cancelled |= cancel.is_cancelled();
        report
    }

    fn task(&self, phase: &WarmPhase, target: WarmTarget, ttl: Option<Duration>) -> PoolTask<FetchError> {
        let cache = self.cache.clone();
        let fetch = phase.fetch.clone();
        let WarmTarget { id, key } = target;
        pool::task(move |_| async move {
            let fetch = fetch_fn(move || fetch(id.clone()));
            cache.prefetch(&key, &fetch, ttl).await.map_err(|e| {
                debug!(key = %key, error = %e, "Warm fetch failed");
                e
            })?;
            Ok::<_, FetchError>(())
        })
    }
}
