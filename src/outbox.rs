use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, UnixTimeMs};
use crate::coalesce::{self, EnqueueOutcome};
use crate::config::OutboxConfig;
use crate::error::{DispatchError, OutboxError};
use crate::lock::ProcessingSession;
use crate::metrics::SyncMetrics;
use crate::model::{FailedArchiveItem, GenericPayload, ItemStatus, OutboxItem, OutboxOp, Uid};
use crate::registry::{server_id_of, EntityRegistry};
use crate::store::{PersistedState, StoreKey};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepthSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub archived: usize,
    pub by_entity: BTreeMap<String, usize>,
}

// ============================================================================
// Outbox
// ============================================================================

/// Durable mutation queue. All writes go through the shared
/// [`PersistedState`] critical section.
pub struct Outbox {
    state: Arc<PersistedState>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    metrics: Arc<SyncMetrics>,
}

impl Outbox {
    pub fn new(
        state: Arc<PersistedState>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        Ok(Self {
            state,
            registry,
            clock,
            config,
            metrics,
        })
    }

    #[must_use]
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Queue a mutation, coalescing it with any queued mutation of the same
    /// record.
    #[instrument(skip(self, payload), fields(entity = %payload.entity, op = %op))]
    pub async fn enqueue(
        &self,
        op: OutboxOp,
        payload: GenericPayload,
    ) -> Result<EnqueueOutcome, OutboxError> {
        if !self.registry.contains(&payload.entity) {
            return Err(OutboxError::UnknownEntity(payload.entity));
        }
        if op != OutboxOp::Create && !payload.has_identity() {
            return Err(OutboxError::MissingIdentity {
                entity: payload.entity,
            });
        }

        let now = self.clock.now();
        let max = self.config.max_queue_entries;
        let result = self
            .state
            .modify(StoreKey::Queue, move |queue: &mut Vec<OutboxItem>| {
                let outcome = coalesce::apply(queue, op, payload, now);
                if matches!(outcome, EnqueueOutcome::Appended { .. }) && queue.len() > max {
                    return Err(OutboxError::Full(max));
                }
                Ok(outcome)
            })
            .await;

        match &result {
            Ok(EnqueueOutcome::Appended { uid }) => {
                SyncMetrics::incr(&self.metrics.enqueued);
                info!(uid = %uid, "Entry appended");
            }
            Ok(EnqueueOutcome::Merged { uid }) => {
                SyncMetrics::incr(&self.metrics.merged);
                debug!(uid = %uid, "Merged into queued entry");
            }
            Ok(EnqueueOutcome::Replaced { removed, uid }) => {
                SyncMetrics::incr(&self.metrics.replaced);
                SyncMetrics::incr(&self.metrics.enqueued);
                info!(uid = %uid, removed = removed.len(), "Replaced queued entries");
            }
            Ok(EnqueueOutcome::Cancelled { removed }) => {
                SyncMetrics::incr(&self.metrics.cancelled);
                info!(removed = removed.len(), "Local-only record cancelled out");
            }
            Err(OutboxError::Full(max)) => {
                SyncMetrics::incr(&self.metrics.rejected_full);
                warn!(max, "Outbox full, rejecting entry");
            }
            Err(e) => warn!(error = %e, "Enqueue failed"),
        }
        result
    }

    pub async fn items(&self) -> Result<Vec<OutboxItem>, OutboxError> {
        Ok(self.state.load(StoreKey::Queue).await?)
    }

    pub async fn get(&self, uid: &Uid) -> Result<Option<OutboxItem>, OutboxError> {
        let queue: Vec<OutboxItem> = self.state.load(StoreKey::Queue).await?;
        Ok(queue.into_iter().find(|item| &item.uid == uid))
    }

    pub async fn counts(&self) -> Result<QueueDepthSnapshot, OutboxError> {
        let txn = self.state.transaction().await;
        let queue: Vec<OutboxItem> = txn.load(StoreKey::Queue).await?;
        let archive: Vec<FailedArchiveItem> = txn.load(StoreKey::FailedArchive).await?;
        drop(txn);

        let mut snapshot = QueueDepthSnapshot {
            total: queue.len(),
            archived: archive.len(),
            ..QueueDepthSnapshot::default()
        };
        for item in &queue {
            match item.status {
                ItemStatus::Pending => snapshot.pending += 1,
                ItemStatus::InProgress => snapshot.in_progress += 1,
                ItemStatus::Succeeded => snapshot.succeeded += 1,
                ItemStatus::Failed => snapshot.failed += 1,
            }
            *snapshot.by_entity.entry(item.entity().to_string()).or_default() += 1;
        }
        Ok(snapshot)
    }

    /// Move a failed entry back to pending.
    #[instrument(skip(self), fields(uid = %uid))]
    pub async fn retry(&self, uid: &Uid) -> Result<(), OutboxError> {
        let now = self.clock.now();
        self.state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let item = find_mut(queue, uid)?;
                if item.status != ItemStatus::Failed {
                    return Err(OutboxError::InvalidStateTransition {
                        from: item.status,
                        to: ItemStatus::Pending,
                    });
                }
                item.requeue(now)
            })
            .await?;
        info!("Entry requeued for retry");
        Ok(())
    }

    /// Drop an entry that is not currently being dispatched.
    #[instrument(skip(self), fields(uid = %uid))]
    pub async fn remove(&self, uid: &Uid) -> Result<OutboxItem, OutboxError> {
        let removed = self
            .state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let pos = position(queue, uid)?;
                if queue[pos].status == ItemStatus::InProgress {
                    return Err(OutboxError::InFlight(uid.to_string()));
                }
                Ok(queue.remove(pos))
            })
            .await?;
        info!("Entry removed");
        Ok(removed)
    }

    /// Move one entry into the failed archive.
    #[instrument(skip(self), fields(uid = %uid))]
    pub async fn archive(&self, uid: &Uid) -> Result<(), OutboxError> {
        let archived = self
            .archive_where(|item| &item.uid == uid)
            .await?;
        if archived.is_empty() {
            let queue: Vec<OutboxItem> = self.state.load(StoreKey::Queue).await?;
            return match queue.iter().find(|item| &item.uid == uid) {
                Some(_) => Err(OutboxError::InFlight(uid.to_string())),
                None => Err(OutboxError::NotFound(uid.to_string())),
            };
        }
        Ok(())
    }

    /// Archive failed entries that reached `max_attempts` or failed with a
    /// non-retryable error.
    #[instrument(skip(self))]
    pub async fn archive_exhausted(&self, max_attempts: u32) -> Result<Vec<Uid>, OutboxError> {
        self.archive_where(|item| {
            item.status == ItemStatus::Failed && (item.attempts >= max_attempts || item.is_fatal())
        })
        .await
    }

    pub async fn failed_archive(&self) -> Result<Vec<FailedArchiveItem>, OutboxError> {
        Ok(self.state.load(StoreKey::FailedArchive).await?)
    }

    pub async fn clear_archive(&self) -> Result<(), OutboxError> {
        self.state.clear(StoreKey::FailedArchive).await?;
        info!("Failed archive cleared");
        Ok(())
    }

    pub async fn last_session(&self) -> Result<Option<ProcessingSession>, OutboxError> {
        Ok(self.state.load(StoreKey::Session).await?)
    }

    /// Raw bytes of the last queue blob that could not be parsed.
    pub async fn quarantined(&self) -> Result<Option<Vec<u8>>, OutboxError> {
        Ok(self.state.quarantined().await?)
    }

    async fn archive_where<P>(&self, predicate: P) -> Result<Vec<Uid>, OutboxError>
    where
        P: Fn(&OutboxItem) -> bool + Send + Sync,
    {
        let now = self.clock.now();
        let txn = self.state.transaction().await;
        let mut queue: Vec<OutboxItem> = txn.load(StoreKey::Queue).await?;

        let (moved, kept): (Vec<_>, Vec<_>) = queue
            .drain(..)
            .partition(|item| item.status != ItemStatus::InProgress && predicate(item));
        if moved.is_empty() {
            return Ok(Vec::new());
        }

        let mut archive: Vec<FailedArchiveItem> = txn.load(StoreKey::FailedArchive).await?;
        let uids: Vec<Uid> = moved.iter().map(|item| item.uid.clone()).collect();
        archive.extend(moved.into_iter().map(|item| FailedArchiveItem {
            item,
            archived_at: now,
        }));
        let overflow = archive.len().saturating_sub(self.config.max_archive_entries);
        if overflow > 0 {
            archive.drain(..overflow);
            debug!(overflow, "Dropped oldest archived entries");
        }

        // Archive first: a crash in between duplicates rather than loses.
        txn.save(StoreKey::FailedArchive, &archive).await?;
        txn.save(StoreKey::Queue, &kept).await?;

        SyncMetrics::add(&self.metrics.archived, uids.len());
        info!(count = uids.len(), "Archived failed entries");
        Ok(uids)
    }

    // ========================================================================
    // Drain-side transitions
    // ========================================================================

    /// Requeue entries stuck `in_progress` past the threshold.
    pub(crate) async fn requeue_stuck(&self) -> Result<Vec<Uid>, OutboxError> {
        let now = self.clock.now();
        let threshold = self.config.stuck_threshold_ms;
        let uids = self
            .state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let mut uids = Vec::new();
                for item in queue.iter_mut().filter(|i| i.is_stuck(now, threshold)) {
                    item.requeue(now)?;
                    uids.push(item.uid.clone());
                }
                Ok::<_, OutboxError>(uids)
            })
            .await?;
        if !uids.is_empty() {
            SyncMetrics::add(&self.metrics.stuck_requeued, uids.len());
            warn!(count = uids.len(), "Requeued stuck entries");
        }
        Ok(uids)
    }

    /// Uids of dispatchable entries, in queue order. Fatal failures wait
    /// for a manual `retry` or `archive`.
    pub(crate) async fn eligible_uids(&self) -> Result<Vec<Uid>, OutboxError> {
        let queue: Vec<OutboxItem> = self.state.load(StoreKey::Queue).await?;
        Ok(queue
            .into_iter()
            .filter(|item| item.is_eligible() && !item.is_fatal())
            .map(|item| item.uid)
            .collect())
    }

    /// Mark an entry in flight and persist before any network call. `None`
    /// when it was removed or rewritten since the snapshot.
    pub(crate) async fn begin_dispatch(&self, uid: &Uid) -> Result<Option<OutboxItem>, OutboxError> {
        let now = self.clock.now();
        self.state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let Some(item) = queue.iter_mut().find(|i| &i.uid == uid) else {
                    return Ok(None);
                };
                if !item.is_eligible() {
                    return Ok(None);
                }
                item.begin_dispatch(now)?;
                Ok(Some(item.clone()))
            })
            .await
    }

    /// Mark success. A create result carrying a server id is written back
    /// into the entry and into entries queued after it for the same client id.
    pub(crate) async fn complete(
        &self,
        uid: &Uid,
        result: &Value,
    ) -> Result<Option<OutboxItem>, OutboxError> {
        let now = self.clock.now();
        let server_id = server_id_of(result);
        self.state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let Some(pos) = queue.iter().position(|i| &i.uid == uid) else {
                    return Ok(None);
                };
                queue[pos].mark_succeeded(now)?;
                if queue[pos].op == OutboxOp::Create {
                    if let Some(id) = &server_id {
                        reconcile_server_id(queue, pos, id);
                    }
                }
                Ok(Some(queue[pos].clone()))
            })
            .await
    }

    pub(crate) async fn fail(
        &self,
        uid: &Uid,
        error: &DispatchError,
    ) -> Result<Option<OutboxItem>, OutboxError> {
        let now = self.clock.now();
        self.state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let Some(item) = queue.iter_mut().find(|i| &i.uid == uid) else {
                    return Ok(None);
                };
                item.record_failure(error, now)?;
                Ok(Some(item.clone()))
            })
            .await
    }

    pub(crate) async fn prune_succeeded(&self) -> Result<usize, OutboxError> {
        self.state
            .modify(StoreKey::Queue, |queue: &mut Vec<OutboxItem>| {
                let before = queue.len();
                queue.retain(|item| item.status != ItemStatus::Succeeded);
                Ok::<_, OutboxError>(before - queue.len())
            })
            .await
    }

    pub(crate) async fn record_session(&self, session: &ProcessingSession) -> Result<(), OutboxError> {
        Ok(self.state.save(StoreKey::Session, session).await?)
    }

    pub(crate) fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }
}

fn position(queue: &[OutboxItem], uid: &Uid) -> Result<usize, OutboxError> {
    queue
        .iter()
        .position(|item| &item.uid == uid)
        .ok_or_else(|| OutboxError::NotFound(uid.to_string()))
}

fn find_mut<'a>(queue: &'a mut [OutboxItem], uid: &Uid) -> Result<&'a mut OutboxItem, OutboxError> {
    queue
        .iter_mut()
        .find(|item| &item.uid == uid)
        .ok_or_else(|| OutboxError::NotFound(uid.to_string()))
}

fn reconcile_server_id(queue: &mut [OutboxItem], created: usize, id: &str) {
    let entity = queue[created].payload.entity.clone();
    let client_id = queue[created].payload.client_id.clone();
    queue[created].payload.id = Some(id.to_string());

    let Some(client_id) = client_id else {
        return;
    };
    // Earlier items belong to a previous life of the record.
    for item in queue.iter_mut().skip(created + 1) {
        if item.payload.entity == entity
            && item.payload.client_id.as_deref() == Some(client_id.as_str())
            && item.payload.id.is_none()
        {
            item.payload.id = Some(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::EntityService;
    use crate::store::testing::FailableStore;
    use crate::store::{MemoryStore, QueueStore};

    struct Noop;

    #[async_trait]
    impl EntityService for Noop {}

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn make_registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::new()
                .with("reports", Arc::new(Noop))
                .with("photos", Arc::new(Noop)),
        )
    }

    fn make_outbox_with(store: Arc<dyn QueueStore>, config: OutboxConfig) -> (Arc<ManualClock>, Outbox) {
        let clock = Arc::new(ManualClock::new(make_now()));
        let outbox = Outbox::new(
            Arc::new(PersistedState::new(store)),
            make_registry(),
            clock.clone(),
            config,
            Arc::new(SyncMetrics::new()),
        )
        .unwrap();
        (clock, outbox)
    }

    fn make_outbox() -> (Arc<ManualClock>, Outbox) {
        make_outbox_with(Arc::new(MemoryStore::new()), OutboxConfig::default())
    }

    fn report(client_id: &str) -> GenericPayload {
        GenericPayload::new("reports").with_client_id(client_id)
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_entry() {
        let (_, outbox) = make_outbox();
        let outcome = outbox
            .enqueue(OutboxOp::Create, report("c1").with_field("title", "Hall"))
            .await
            .unwrap();

        let items = outbox.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(Some(&items[0].uid), outcome.uid());
        assert_eq!(items[0].status, ItemStatus::Pending);
        assert_eq!(items[0].attempts, 0);
        assert_eq!(outbox.metrics.snapshot().enqueued, 1);
    }

    #[tokio::test]
    async fn test_unknown_entity_rejected_at_enqueue() {
        let (_, outbox) = make_outbox();
        let err = outbox
            .enqueue(OutboxOp::Create, GenericPayload::new("ghosts"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::UnknownEntity(e) if e == "ghosts"));
        assert!(outbox.items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_identity() {
        let (_, outbox) = make_outbox();
        let err = outbox
            .enqueue(OutboxOp::Update, GenericPayload::new("reports"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::MissingIdentity { .. }));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_append_but_allows_merge() {
        let config = OutboxConfig {
            max_queue_entries: 1,
            ..OutboxConfig::default()
        };
        let (_, outbox) = make_outbox_with(Arc::new(MemoryStore::new()), config);

        outbox.enqueue(OutboxOp::Create, report("c1")).await.unwrap();
        let err = outbox.enqueue(OutboxOp::Create, report("c2")).await.unwrap_err();
        assert!(matches!(err, OutboxError::Full(1)));

        let merged = outbox
            .enqueue(OutboxOp::Update, report("c1").with_field("x", 1))
            .await
            .unwrap();
        assert!(matches!(merged, EnqueueOutcome::Merged { .. }));
        assert_eq!(outbox.items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_and_leaves_queue_intact() {
        let store = Arc::new(FailableStore::new(MemoryStore::new()));
        let (_, outbox) = make_outbox_with(store.clone(), OutboxConfig::default());
        outbox.enqueue(OutboxOp::Create, report("c1")).await.unwrap();

        store.set_fail_writes(true);
        let err = outbox.enqueue(OutboxOp::Create, report("c2")).await.unwrap_err();
        assert!(matches!(err, OutboxError::Storage(_)));

        store.set_fail_writes(false);
        assert_eq!(outbox.items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts_by_status_and_entity() {
        let (_, outbox) = make_outbox();
        let a = outbox.enqueue(OutboxOp::Create, report("c1")).await.unwrap();
        outbox.enqueue(OutboxOp::Create, report("c2")).await.unwrap();
        outbox
            .enqueue(OutboxOp::Create, GenericPayload::new("photos").with_client_id("p1"))
            .await
            .unwrap();

        let uid = a.uid().unwrap();
        outbox.begin_dispatch(uid).await.unwrap().unwrap();
        outbox.fail(uid, &DispatchError::network("offline")).await.unwrap();

        let counts = outbox.counts().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.by_entity["reports"], 2);
        assert_eq!(counts.by_entity["photos"], 1);
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let (_, outbox) = make_outbox();
        let outcome = outbox.enqueue(OutboxOp::Create, report("c1")).await.unwrap();
        let uid = outcome.uid().unwrap();

        assert!(matches!(
            outbox.retry(uid).await,
            Err(OutboxError::InvalidStateTransition { .. })
        ));

        outbox.begin_dispatch(uid).await.unwrap();
        outbox.fail(uid, &DispatchError::transient("503")).await.unwrap();
        outbox.retry(uid).await.unwrap();
        assert_eq!(outbox.get(uid).await.unwrap().unwrap().status, ItemStatus::Pending);

        assert!(matches!(
            outbox.retry(&Uid::new("missing")).await,
            Err(OutboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_refuses_in_flight() {
        let (_, outbox) = make_outbox();
        let uid = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.begin_dispatch(&uid).await.unwrap();
        assert!(matches!(outbox.remove(&uid).await, Err(OutboxError::InFlight(_))));
    }

    #[tokio::test]
    async fn test_archive_exhausted_and_bounded() {
        let config = OutboxConfig {
            max_archive_entries: 2,
            ..OutboxConfig::default()
        };
        let (_, outbox) = make_outbox_with(Arc::new(MemoryStore::new()), config);

        for i in 0..3 {
            let uid = outbox
                .enqueue(OutboxOp::Create, report(&format!("c{i}")))
                .await
                .unwrap()
                .uid()
                .unwrap()
                .clone();
            outbox.begin_dispatch(&uid).await.unwrap();
            outbox.fail(&uid, &DispatchError::transient("down")).await.unwrap();
        }
        let untouched = outbox.enqueue(OutboxOp::Create, report("keep")).await.unwrap();

        assert!(outbox.archive_exhausted(2).await.unwrap().is_empty());
        let archived = outbox.archive_exhausted(1).await.unwrap();
        assert_eq!(archived.len(), 3);

        let items = outbox.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(Some(&items[0].uid), untouched.uid());

        let archive = outbox.failed_archive().await.unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive[0].item.payload.client_id.as_deref(), Some("c1"));
        assert_eq!(archive[0].archived_at, make_now());

        outbox.clear_archive().await.unwrap();
        assert!(outbox.failed_archive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failures_archived_regardless_of_attempts() {
        let (_, outbox) = make_outbox();
        let uid = outbox
            .enqueue(OutboxOp::Delete, report("c1").with_id("9"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.begin_dispatch(&uid).await.unwrap();
        outbox
            .fail(&uid, &DispatchError::missing_handler("reports", OutboxOp::Delete))
            .await
            .unwrap();

        assert_eq!(outbox.archive_exhausted(25).await.unwrap(), vec![uid]);
    }

    #[tokio::test]
    async fn test_archive_single_entry() {
        let (_, outbox) = make_outbox();
        let uid = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.archive(&uid).await.unwrap();
        assert!(outbox.items().await.unwrap().is_empty());
        assert_eq!(outbox.counts().await.unwrap().archived, 1);
        assert!(matches!(outbox.archive(&uid).await, Err(OutboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_requeue_stuck_after_threshold() {
        let (clock, outbox) = make_outbox();
        let uid = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.begin_dispatch(&uid).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert!(outbox.requeue_stuck().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(121));
        assert_eq!(outbox.requeue_stuck().await.unwrap(), vec![uid.clone()]);
        let item = outbox.get(&uid).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
    }

    #[tokio::test]
    async fn test_complete_reconciles_server_id() {
        let (_, outbox) = make_outbox();
        let created = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.begin_dispatch(&created).await.unwrap();

        // Enqueued while the create is in flight, so it is appended.
        let later = outbox
            .enqueue(OutboxOp::Update, report("c1").with_field("x", 1))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();

        let done = outbox
            .complete(&created, &json!({ "id": "srv-1" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.payload.id.as_deref(), Some("srv-1"));
        assert_eq!(
            outbox.get(&later).await.unwrap().unwrap().payload.id.as_deref(),
            Some("srv-1")
        );

        assert_eq!(outbox.prune_succeeded().await.unwrap(), 1);
        assert_eq!(outbox.items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_earlier_tombstone_alone() {
        let (_, outbox) = make_outbox();
        let tombstone = outbox
            .enqueue(OutboxOp::Delete, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        let created = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        assert_eq!(outbox.items().await.unwrap().len(), 2);

        outbox.begin_dispatch(&created).await.unwrap();
        outbox
            .complete(&created, &json!({ "id": "srv-2" }))
            .await
            .unwrap();

        let tombstone = outbox.get(&tombstone).await.unwrap().unwrap();
        assert_eq!(tombstone.op, OutboxOp::Delete);
        assert_eq!(tombstone.payload.id, None);
    }

    #[tokio::test]
    async fn test_begin_dispatch_skips_vanished_entries() {
        let (_, outbox) = make_outbox();
        let uid = outbox
            .enqueue(OutboxOp::Create, report("c1"))
            .await
            .unwrap()
            .uid()
            .unwrap()
            .clone();
        outbox.enqueue(OutboxOp::Delete, report("c1")).await.unwrap();
        assert!(outbox.begin_dispatch(&uid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_queue_is_quarantined() {
        let store = Arc::new(MemoryStore::new());
        store.write(StoreKey::Queue, b"[{\"uid\":".to_vec()).await.unwrap();
        let (_, outbox) = make_outbox_with(store, OutboxConfig::default());

        assert!(outbox.items().await.unwrap().is_empty());
        assert!(outbox.quarantined().await.unwrap().is_some());

        outbox.enqueue(OutboxOp::Create, report("c1")).await.unwrap();
        assert_eq!(outbox.items().await.unwrap().len(), 1);
    }
}
