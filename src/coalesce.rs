//! Collapsing of queued mutations that target the same record.
//!
//! | existing \ incoming | create  | update  | delete                          |
//! |---------------------|---------|---------|---------------------------------|
//! | (none)              | append  | append  | append                          |
//! | create              | merge   | merge   | cancel, or replace with id      |
//! | update              | merge   | merge   | replace                         |
//! | delete              | append  | merge   | merge                           |
//!
//! Only `pending` and `failed` items take part. An `in_progress` item is
//! already on the wire and is left alone; the incoming op is appended.
//!
//! A create queued behind a delete starts a new life for the record. The
//! delete stays as a tombstone for the old one and later ops coalesce with
//! the items queued after it. Merging into a `failed` item reopens it.

use serde::{Deserialize, Serialize};

use crate::clock::UnixTimeMs;
use crate::model::{GenericPayload, OutboxItem, OutboxOp, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoalesceAction {
    /// Fold the incoming body into the existing item. Op and uid are kept.
    Merge,
    /// Drop the existing items. Nothing is appended.
    Cancel,
    /// Drop the existing items and append the incoming op as a new item.
    Replace,
    Append,
}

/// Decide what an incoming op does to the queue. `existing` is the op of the
/// oldest eligible item for the same record, if any.
#[must_use]
pub const fn decide(
    existing: Option<OutboxOp>,
    incoming: OutboxOp,
    server_id_known: bool,
) -> CoalesceAction {
    use CoalesceAction::{Append, Cancel, Merge, Replace};
    use OutboxOp::{Create, Delete, Update};

    match (existing, incoming) {
        (None, _) => Append,

        (Some(Create | Update), Create | Update) => Merge,

        // Record never reached the server: both sides vanish.
        (Some(Create), Delete) if !server_id_known => Cancel,
        (Some(Create), Delete) => Replace,
        // An update with no pending create targets a record the server has.
        (Some(Update), Delete) => Replace,

        // The delete still has to reach the server before the new record.
        (Some(Delete), Create) => Append,
        (Some(Delete), Update | Delete) => Merge,
    }
}

/// What `enqueue` did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Appended { uid: Uid },
    Merged { uid: Uid },
    Replaced { removed: Vec<Uid>, uid: Uid },
    /// Net-zero: the incoming delete cancelled a record that only existed
    /// locally. No item carries this mutation.
    Cancelled { removed: Vec<Uid> },
}

impl EnqueueOutcome {
    /// Uid of the queue item now carrying the mutation.
    #[must_use]
    pub fn uid(&self) -> Option<&Uid> {
        match self {
            Self::Appended { uid } | Self::Merged { uid } | Self::Replaced { uid, .. } => {
                Some(uid)
            }
            Self::Cancelled { .. } => None,
        }
    }
}

/// Apply `incoming` to `queue` in place.
pub fn apply(
    queue: &mut Vec<OutboxItem>,
    op: OutboxOp,
    payload: GenericPayload,
    now: UnixTimeMs,
) -> EnqueueOutcome {
    let matches: Vec<usize> = queue
        .iter()
        .enumerate()
        .filter(|(_, item)| item.is_eligible() && item.payload.same_record(&payload))
        .map(|(i, _)| i)
        .collect();
    let (tombstone, live) = split_tombstone(queue.as_slice(), &matches);

    let existing = live.first().map(|&i| queue[i].op);
    let server_id_known =
        payload.has_server_id() || live.iter().any(|&i| queue[i].payload.has_server_id());

    match decide(existing, op, server_id_known) {
        CoalesceAction::Append => EnqueueOutcome::Appended {
            uid: append(queue, op, payload, now),
        },
        CoalesceAction::Merge => EnqueueOutcome::Merged {
            uid: absorb(&mut queue[live[0]], &payload, now),
        },
        CoalesceAction::Cancel => EnqueueOutcome::Cancelled {
            removed: remove_indices(queue, live),
        },
        CoalesceAction::Replace => {
            let known_id = live.iter().find_map(|&i| queue[i].payload.id.clone());
            let removed = remove_indices(queue, live);
            // Indices before the removed ones are unchanged.
            if let Some(t) = tombstone {
                let uid = absorb(&mut queue[t], &payload, now);
                return EnqueueOutcome::Replaced { removed, uid };
            }
            let mut payload = payload;
            if op == OutboxOp::Delete && payload.id.is_none() {
                payload.id = known_id;
            }
            let uid = append(queue, op, payload, now);
            EnqueueOutcome::Replaced { removed, uid }
        }
    }
}

/// Split off a delete that has newer items for the same record queued after
/// it. Only those newer items are coalesced against.
fn split_tombstone<'a>(
    queue: &[OutboxItem],
    matches: &'a [usize],
) -> (Option<usize>, &'a [usize]) {
    match matches
        .iter()
        .rposition(|&i| queue[i].op == OutboxOp::Delete)
    {
        Some(pos) if pos + 1 < matches.len() => (Some(matches[pos]), &matches[pos + 1..]),
        _ => (None, matches),
    }
}

fn absorb(item: &mut OutboxItem, payload: &GenericPayload, now: UnixTimeMs) -> Uid {
    item.absorb(payload, now);
    item.uid.clone()
}

fn append(
    queue: &mut Vec<OutboxItem>,
    op: OutboxOp,
    payload: GenericPayload,
    now: UnixTimeMs,
) -> Uid {
    let item = OutboxItem::new(op, payload, now);
    let uid = item.uid.clone();
    queue.push(item);
    uid
}

fn remove_indices(queue: &mut Vec<OutboxItem>, indices: &[usize]) -> Vec<Uid> {
    let mut removed = Vec::with_capacity(indices.len());
    for &i in indices.iter().rev() {
        removed.push(queue.remove(i).uid);
    }
    removed.reverse();
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemStatus;
    use serde_json::json;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn report(client_id: &str) -> GenericPayload {
        GenericPayload::new("reports").with_client_id(client_id)
    }

    fn server(id: &str) -> GenericPayload {
        GenericPayload::new("reports").with_id(id)
    }

    #[test]
    fn test_decide_is_total() {
        let ops = [OutboxOp::Create, OutboxOp::Update, OutboxOp::Delete];
        for incoming in ops {
            assert_eq!(decide(None, incoming, false), CoalesceAction::Append);
            for existing in ops {
                for known in [false, true] {
                    // Every cell resolves to something; this walks the table.
                    let _ = decide(Some(existing), incoming, known);
                }
            }
        }
    }

    #[test]
    fn test_create_then_update_merges_into_create() {
        let mut queue = Vec::new();
        let now = make_now();
        let first = apply(
            &mut queue,
            OutboxOp::Create,
            report("c1").with_field("title", "draft").with_field("room", "kitchen"),
            now,
        );
        let second = apply(
            &mut queue,
            OutboxOp::Update,
            report("c1").with_field("title", "final"),
            now.add_millis(10),
        );

        assert_eq!(queue.len(), 1);
        assert_eq!(second, EnqueueOutcome::Merged { uid: first.uid().unwrap().clone() });
        let item = &queue[0];
        assert_eq!(item.op, OutboxOp::Create);
        assert_eq!(item.payload.body["title"], json!("final"));
        assert_eq!(item.payload.body["room"], json!("kitchen"));
        assert_eq!(item.updated_at, now.add_millis(10));
        assert_eq!(item.attempts, 0);
    }

    #[test]
    fn test_create_then_delete_without_server_id_cancels() {
        let mut queue = Vec::new();
        let now = make_now();
        let created = apply(&mut queue, OutboxOp::Create, report("c1"), now);
        let outcome = apply(&mut queue, OutboxOp::Delete, report("c1"), now);

        assert!(queue.is_empty());
        assert_eq!(
            outcome,
            EnqueueOutcome::Cancelled {
                removed: vec![created.uid().unwrap().clone()]
            }
        );
        assert!(outcome.uid().is_none());
    }

    #[test]
    fn test_delete_with_server_id_still_reaches_server() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(
            &mut queue,
            OutboxOp::Create,
            report("c1").with_id("srv-1").with_field("x", 1),
            now,
        );
        let outcome = apply(&mut queue, OutboxOp::Delete, report("c1"), now);

        assert!(matches!(outcome, EnqueueOutcome::Replaced { .. }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, OutboxOp::Delete);
        assert_eq!(queue[0].payload.id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_update_then_delete_leaves_single_delete() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Update, report("c1"), now);
        apply(&mut queue, OutboxOp::Delete, report("c1"), now);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, OutboxOp::Delete);
    }

    #[test]
    fn test_in_flight_items_are_not_coalesced() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Create, report("c1"), now);
        queue[0].begin_dispatch(now).unwrap();

        let outcome = apply(&mut queue, OutboxOp::Update, report("c1"), now);
        assert!(matches!(outcome, EnqueueOutcome::Appended { .. }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].status, ItemStatus::InProgress);
    }

    #[test]
    fn test_failed_items_are_coalesced() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Update, report("c1").with_field("a", 1), now);
        queue[0].begin_dispatch(now).unwrap();
        queue[0].mark_failed("offline", now).unwrap();

        apply(&mut queue, OutboxOp::Update, report("c1").with_field("b", 2), now);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, ItemStatus::Pending);
        assert_eq!(queue[0].last_error, None);
        assert_eq!(queue[0].payload.body["a"], json!(1));
        assert_eq!(queue[0].payload.body["b"], json!(2));
    }

    #[test]
    fn test_create_after_delete_queues_behind_it() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Delete, report("c1").with_id("s1"), now);
        let outcome = apply(
            &mut queue,
            OutboxOp::Create,
            report("c1").with_field("v", 2),
            now,
        );

        assert!(matches!(outcome, EnqueueOutcome::Appended { .. }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].op, OutboxOp::Delete);
        assert_eq!(queue[0].payload.id.as_deref(), Some("s1"));
        assert_eq!(queue[1].op, OutboxOp::Create);
        assert_eq!(queue[1].payload.id, None);
    }

    #[test]
    fn test_ops_after_recreate_target_the_new_record() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Delete, report("c1").with_id("s1"), now);
        let created = apply(&mut queue, OutboxOp::Create, report("c1"), now);

        let updated = apply(
            &mut queue,
            OutboxOp::Update,
            report("c1").with_field("v", 2),
            now,
        );
        assert_eq!(updated, EnqueueOutcome::Merged { uid: created.uid().unwrap().clone() });
        assert_eq!(queue[0].op, OutboxOp::Delete);
        assert_eq!(queue[1].payload.body["v"], json!(2));

        // The new record never reached the server: only it is cancelled.
        let deleted = apply(&mut queue, OutboxOp::Delete, report("c1"), now);
        assert!(matches!(
            deleted,
            EnqueueOutcome::Cancelled { ref removed } if removed.len() == 1
        ));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, OutboxOp::Delete);
        assert_eq!(queue[0].payload.id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_delete_of_recreated_server_record_folds_into_tombstone() {
        let mut queue = Vec::new();
        let now = make_now();
        let tombstone = apply(&mut queue, OutboxOp::Delete, server("s1"), now);
        apply(&mut queue, OutboxOp::Create, server("s1").with_field("v", 1), now);
        let outcome = apply(&mut queue, OutboxOp::Delete, server("s1"), now);

        assert!(matches!(
            outcome,
            EnqueueOutcome::Replaced { ref uid, ref removed }
                if Some(uid) == tombstone.uid() && removed.len() == 1
        ));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, OutboxOp::Delete);
    }

    #[test]
    fn test_delete_by_server_id_alone_replaces_update() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(
            &mut queue,
            OutboxOp::Update,
            report("c1").with_id("s1").with_field("x", 1),
            now,
        );
        apply(&mut queue, OutboxOp::Delete, server("s1"), now);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, OutboxOp::Delete);
        assert_eq!(queue[0].payload.id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_distinct_records_are_independent() {
        let mut queue = Vec::new();
        let now = make_now();
        apply(&mut queue, OutboxOp::Create, report("c1"), now);
        apply(&mut queue, OutboxOp::Create, report("c2"), now);
        apply(
            &mut queue,
            OutboxOp::Create,
            GenericPayload::new("photos").with_client_id("c1"),
            now,
        );
        assert_eq!(queue.len(), 3);
    }
}
