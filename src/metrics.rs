use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Outbox
    pub enqueued: AtomicU64,
    pub merged: AtomicU64,
    pub cancelled: AtomicU64,
    pub replaced: AtomicU64,
    pub rejected_full: AtomicU64,
    pub archived: AtomicU64,

    // Drain
    pub drains_started: AtomicU64,
    pub lock_contention: AtomicU64,
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub stuck_requeued: AtomicU64,

    // Prefetch and warm
    pub prefetched: AtomicU64,
    pub prefetch_failures: AtomicU64,
    pub prefetch_skipped: AtomicU64,
}

impl SyncMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            drains_started: self.drains_started.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stuck_requeued: self.stuck_requeued.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
            prefetch_failures: self.prefetch_failures.load(Ordering::Relaxed),
            prefetch_skipped: self.prefetch_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub merged: u64,
    pub cancelled: u64,
    pub replaced: u64,
    pub rejected_full: u64,
    pub archived: u64,
    pub drains_started: u64,
    pub lock_contention: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stuck_requeued: u64,
    pub prefetched: u64,
    pub prefetch_failures: u64,
    pub prefetch_skipped: u64,
}
