//! TTL-aware prefetch of remote data into the read cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cache::{needs_fetch, FetchFn, QueryCache, QueryKey};
use crate::config::PrefetchConfig;
use crate::error::FetchError;
use crate::metrics::SyncMetrics;
use crate::network::Connectivity;
use crate::pool::{self, PoolTask};

#[derive(Clone)]
pub struct PrefetchJob {
    pub key: QueryKey,
    pub fetch: FetchFn,
    /// Falls back to the orchestrator's default TTL when unset.
    pub ttl: Option<Duration>,
    pub force: bool,
}

impl PrefetchJob {
    pub fn new(key: QueryKey, fetch: FetchFn) -> Self {
        Self {
            key,
            fetch,
            ttl: None,
            force: false,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

impl std::fmt::Debug for PrefetchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchJob")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub requested: usize,
    /// Still fresh, or duplicates of an earlier job.
    pub skipped: usize,
    pub fetched: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub offline: bool,
}

pub struct PrefetchOrchestrator {
    cache: Arc<dyn QueryCache>,
    connectivity: Arc<dyn Connectivity>,
    config: PrefetchConfig,
    metrics: Arc<SyncMetrics>,
}

impl PrefetchOrchestrator {
    pub fn new(
        cache: Arc<dyn QueryCache>,
        connectivity: Arc<dyn Connectivity>,
        config: PrefetchConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            cache,
            connectivity,
            config,
            metrics,
        }
    }

    /// Jobs that would be fetched right now, deduplicated by key. A later
    /// duplicate can still upgrade the first one to forced.
    pub async fn plan(&self, jobs: Vec<PrefetchJob>) -> Vec<PrefetchJob> {
        let mut unique: Vec<PrefetchJob> = Vec::with_capacity(jobs.len());
        let mut seen: HashMap<QueryKey, usize> = HashMap::new();
        for job in jobs {
            if let Some(&idx) = seen.get(&job.key) {
                unique[idx].force |= job.force;
                continue;
            }
            seen.insert(job.key.clone(), unique.len());
            unique.push(job);
        }

        let now = self.cache.now();
        let mut planned = Vec::with_capacity(unique.len());
        for job in unique {
            let entry = self.cache.get_state(&job.key).await;
            let ttl = job.ttl.or_else(|| self.config.default_ttl());
            if needs_fetch(entry.as_ref(), ttl, job.force, now) {
                planned.push(job);
            }
        }
        planned
    }

    /// Best effort: failures are logged per job and never returned.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn run(&self, jobs: Vec<PrefetchJob>, cancel: &CancellationToken) -> PrefetchReport {
        let requested = jobs.len();
        let mut report = PrefetchReport {
            requested,
            ..PrefetchReport::default()
        };
        if requested == 0 {
            return report;
        }
        if cancel.is_cancelled() {
            report.cancelled = requested;
            return report;
        }
        if !self.connectivity.is_connected().await {
            debug!("Offline, prefetch batch skipped");
            SyncMetrics::add(&self.metrics.prefetch_skipped, requested);
            report.offline = true;
            report.skipped = requested;
            return report;
        }

        let planned = self.plan(jobs).await;
        report.skipped = requested - planned.len();
        SyncMetrics::add(&self.metrics.prefetch_skipped, report.skipped);

        let tasks: Vec<PoolTask<FetchError>> = planned
            .into_iter()
            .map(|job| self.task(job))
            .collect();
        let outcome = pool::run(tasks, self.config.concurrency, cancel).await;

        report.fetched = outcome.succeeded;
        report.failed = outcome.failed;
        report.cancelled = outcome.cancelled;
        SyncMetrics::add(&self.metrics.prefetched, outcome.succeeded);
        SyncMetrics::add(&self.metrics.prefetch_failures, outcome.failed);

        info!(
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "Prefetch batch finished"
        );
        report
    }

    fn task(&self, job: PrefetchJob) -> PoolTask<FetchError> {
        let cache = self.cache.clone();
        pool::task(move |token: CancellationToken| async move {
            let data = (job.fetch)().await.map_err(|e| {
                debug!(key = %job.key, error = %e, "Prefetch failed");
                e
            })?;
            if token.is_cancelled() {
                return Ok(());
            }
            cache.set_state(&job.key, data).await;
            Ok::<_, FetchError>(())
        })
    }
}
