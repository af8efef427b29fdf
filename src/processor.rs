use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::QueryCache;
use crate::error::OutboxError;
use crate::lock::{ProcessingLock, ProcessingSession};
use crate::metrics::SyncMetrics;
use crate::model::OutboxItem;
use crate::outbox::Outbox;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another session holds the lock; nothing was touched.
    Contended,
    Completed(ProcessingSession),
}

/// Drains the outbox through the entity registry, one entry at a time.
pub struct QueueProcessor {
    outbox: Arc<Outbox>,
    lock: ProcessingLock,
    cache: Arc<dyn QueryCache>,
    metrics: Arc<SyncMetrics>,
}

impl QueueProcessor {
    pub fn new(
        outbox: Arc<Outbox>,
        lock: ProcessingLock,
        cache: Arc<dyn QueryCache>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            outbox,
            lock,
            cache,
            metrics,
        }
    }

    pub async fn drain(&self) -> Result<DrainOutcome, OutboxError> {
        self.drain_with(&CancellationToken::new()).await
    }

    /// One drain pass. Cancellation stops before the next entry or during
    /// a backoff wait; the entry in flight still settles.
    pub async fn drain_with(&self, cancel: &CancellationToken) -> Result<DrainOutcome, OutboxError> {
        let mut session = ProcessingSession::start(self.outbox.now());
        if !self.lock.try_acquire(&session.id).await? {
            SyncMetrics::incr(&self.metrics.lock_contention);
            return Ok(DrainOutcome::Contended);
        }
        SyncMetrics::incr(&self.metrics.drains_started);

        let result = self.run_session(&mut session, cancel).await;

        // Released on every path, including storage failures mid-pass.
        let released = self.lock.release(&session.id).await;

        session.finished_at = Some(self.outbox.now());
        if let Err(e) = self.outbox.record_session(&session).await {
            warn!(error = %e, "Failed to record processing session");
        }

        if let Err(e) = &result {
            error!(session = %session.id, error = %e, "Drain aborted");
        }
        result?;
        released?;
        Ok(DrainOutcome::Completed(session))
    }

    #[instrument(skip_all, fields(session = %session.id))]
    async fn run_session(
        &self,
        session: &mut ProcessingSession,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        session.counts.requeued_stuck = self.outbox.requeue_stuck().await?.len();

        let snapshot = self.outbox.eligible_uids().await?;
        let total = snapshot.len();
        info!(total, "Drain started");

        for (idx, uid) in snapshot.iter().enumerate() {
            if cancel.is_cancelled() {
                session.cancelled = true;
                break;
            }
            if !self.lock.refresh(&session.id).await? {
                warn!("Processing lock taken over, stopping drain");
                break;
            }
            let Some(item) = self.outbox.begin_dispatch(uid).await? else {
                debug!(uid = %uid, "Entry gone since snapshot");
                continue;
            };

            session.counts.dispatched += 1;
            SyncMetrics::incr(&self.metrics.dispatched);

            if self.dispatch(&item).await? {
                session.counts.succeeded += 1;
                continue;
            }
            session.counts.failed += 1;

            if idx + 1 < total {
                let delay = self.outbox.config().backoff(item.attempts);
                debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Backing off");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        session.cancelled = true;
                        break;
                    }
                }
            }
        }

        let pruned = self.outbox.prune_succeeded().await?;
        info!(
            dispatched = session.counts.dispatched,
            succeeded = session.counts.succeeded,
            failed = session.counts.failed,
            pruned,
            "Drain finished"
        );
        Ok(())
    }

    /// Returns whether the remote call succeeded.
    async fn dispatch(&self, item: &OutboxItem) -> Result<bool, OutboxError> {
        let registry = self.outbox.registry();
        match registry.dispatch(item.op, &item.payload).await {
            Ok(result) => {
                SyncMetrics::incr(&self.metrics.succeeded);
                if let Some(done) = self.outbox.complete(&item.uid, &result).await? {
                    for key in registry.cache_keys(&done.payload) {
                        self.cache.invalidate(&key).await;
                    }
                }
                debug!(uid = %item.uid, entity = %item.entity(), "Dispatched");
                Ok(true)
            }
            Err(e) => {
                SyncMetrics::incr(&self.metrics.failed);
                warn!(
                    uid = %item.uid,
                    entity = %item.entity(),
                    attempts = item.attempts,
                    error = %e,
                    "Dispatch failed"
                );
                self.outbox.fail(&item.uid, &e).await?;
                Ok(false)
            }
        }
    }
}
