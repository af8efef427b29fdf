use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::UnixTimeMs;
use crate::error::{DispatchError, ErrorCategory, OutboxError};

/// Body field naming the parent job a record belongs to. Cache keys for
/// list queries are scoped by it.
pub const PARENT_SCOPE_FIELD: &str = "idJob";

/// Stable identifier of one outbox item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    Create,
    Update,
    Delete,
}

impl OutboxOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ItemStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Statuses the processor picks up and the coalescing engine may rewrite.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity-agnostic mutation payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericPayload {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_created_at: Option<UnixTimeMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_updated_at: Option<UnixTimeMs>,
}

impl GenericPayload {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            client_id: None,
            body: Map::new(),
            client_created_at: None,
            client_updated_at: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_parent_scope(self, id_job: impl Into<Value>) -> Self {
        self.with_field(PARENT_SCOPE_FIELD, id_job)
    }

    #[must_use]
    pub fn has_server_id(&self) -> bool {
        self.id.is_some()
    }

    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.id.is_some() || self.client_id.is_some()
    }

    /// Same entity, and matching `client_id` when both sides carry one,
    /// otherwise matching server `id`. Two payloads without ids never match.
    #[must_use]
    pub fn same_record(&self, other: &Self) -> bool {
        if self.entity != other.entity {
            return false;
        }
        match (&self.client_id, &other.client_id) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b),
        }
    }

    /// Shallow field merge; incoming values win. Identity fields are only
    /// filled in, never overwritten.
    pub fn merge_from(&mut self, incoming: &Self) {
        for (key, value) in &incoming.body {
            self.body.insert(key.clone(), value.clone());
        }
        if self.id.is_none() {
            self.id.clone_from(&incoming.id);
        }
        if self.client_id.is_none() {
            self.client_id.clone_from(&incoming.client_id);
        }
        if self.client_created_at.is_none() {
            self.client_created_at = incoming.client_created_at;
        }
        if incoming.client_updated_at.is_some() {
            self.client_updated_at = incoming.client_updated_at;
        }
    }

    /// Parent job id from the body, rendered as a string.
    #[must_use]
    pub fn parent_scope(&self) -> Option<String> {
        match self.body.get(PARENT_SCOPE_FIELD)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

// ============================================================================
// Outbox Item
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub uid: Uid,
    pub op: OutboxOp,
    pub payload: GenericPayload,
    pub status: ItemStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl OutboxItem {
    #[must_use]
    pub fn new(op: OutboxOp, payload: GenericPayload, now: UnixTimeMs) -> Self {
        Self {
            uid: Uid::generate(),
            op,
            payload,
            status: ItemStatus::Pending,
            attempts: 0,
            last_error: None,
            error_category: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn entity(&self) -> &str {
        &self.payload.entity
    }

    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.status.is_eligible()
    }

    /// `pending | failed -> in_progress`, counting the attempt.
    pub fn begin_dispatch(&mut self, now: UnixTimeMs) -> Result<(), OutboxError> {
        if !self.status.is_eligible() {
            return Err(self.invalid(ItemStatus::InProgress));
        }
        self.status = ItemStatus::InProgress;
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, now: UnixTimeMs) -> Result<(), OutboxError> {
        if self.status != ItemStatus::InProgress {
            return Err(self.invalid(ItemStatus::Succeeded));
        }
        self.status = ItemStatus::Succeeded;
        self.last_error = None;
        self.error_category = None;
        self.updated_at = now;
        Ok(())
    }

    /// Fold a newer edit into this item. A failed item goes back to
    /// `pending` with its error cleared, so the new content gets sent.
    pub fn absorb(&mut self, incoming: &GenericPayload, now: UnixTimeMs) {
        self.payload.merge_from(incoming);
        if self.status == ItemStatus::Failed {
            self.status = ItemStatus::Pending;
            self.last_error = None;
            self.error_category = None;
        }
        self.updated_at = now;
    }

    /// `mark_failed` that also keeps the error category.
    pub fn record_failure(
        &mut self,
        error: &DispatchError,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        self.mark_failed(error.to_string(), now)?;
        self.error_category = Some(error.category);
        Ok(())
    }

    /// Failed with an error that will not go away by retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.status == ItemStatus::Failed
            && self.error_category.is_some_and(|c| !c.is_retryable())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        if self.status != ItemStatus::InProgress {
            return Err(self.invalid(ItemStatus::Failed));
        }
        self.status = ItemStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// `in_progress | failed -> pending`. Used for stuck recovery and manual retry.
    pub fn requeue(&mut self, now: UnixTimeMs) -> Result<(), OutboxError> {
        if !matches!(self.status, ItemStatus::InProgress | ItemStatus::Failed) {
            return Err(self.invalid(ItemStatus::Pending));
        }
        self.status = ItemStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    #[must_use]
    pub fn is_stuck(&self, now: UnixTimeMs, threshold_ms: u64) -> bool {
        self.status == ItemStatus::InProgress && now.elapsed_since(self.updated_at) > threshold_ms
    }

    fn invalid(&self, to: ItemStatus) -> OutboxError {
        OutboxError::InvalidStateTransition {
            from: self.status,
            to,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedArchiveItem {
    #[serde(flatten)]
    pub item: OutboxItem,
    pub archived_at: UnixTimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    #[test]
    fn test_same_record_prefers_client_id() {
        let a = GenericPayload::new("reports").with_client_id("c1").with_id("s1");
        let b = GenericPayload::new("reports").with_client_id("c1").with_id("s2");
        let c = GenericPayload::new("reports").with_client_id("c2").with_id("s1");
        assert!(a.same_record(&b));
        assert!(!a.same_record(&c));
    }

    #[test]
    fn test_same_record_falls_back_to_server_id() {
        let a = GenericPayload::new("reports").with_client_id("c1").with_id("s1");
        let b = GenericPayload::new("reports").with_id("s1");
        assert!(a.same_record(&b));
    }

    #[test]
    fn test_same_record_requires_ids_and_entity() {
        let a = GenericPayload::new("reports");
        let b = GenericPayload::new("reports");
        assert!(!a.same_record(&b));

        let c = GenericPayload::new("reports").with_id("1");
        let d = GenericPayload::new("photos").with_id("1");
        assert!(!c.same_record(&d));
    }

    #[test]
    fn test_merge_new_values_win() {
        let mut existing = GenericPayload::new("reports")
            .with_client_id("c1")
            .with_field("title", "old")
            .with_field("notes", "keep");
        let incoming = GenericPayload::new("reports")
            .with_client_id("c1")
            .with_id("srv-9")
            .with_field("title", "new");

        existing.merge_from(&incoming);

        assert_eq!(existing.body["title"], json!("new"));
        assert_eq!(existing.body["notes"], json!("keep"));
        assert_eq!(existing.id.as_deref(), Some("srv-9"));
    }

    #[test]
    fn test_parent_scope_accepts_numbers_and_strings() {
        let p = GenericPayload::new("items").with_parent_scope(42);
        assert_eq!(p.parent_scope().as_deref(), Some("42"));

        let p = GenericPayload::new("items").with_parent_scope("job-7");
        assert_eq!(p.parent_scope().as_deref(), Some("job-7"));

        assert_eq!(GenericPayload::new("items").parent_scope(), None);
    }

    #[test]
    fn test_state_machine_happy_path() {
        let now = make_now();
        let mut item = OutboxItem::new(OutboxOp::Create, GenericPayload::new("jobs"), now);
        assert_eq!(item.status, ItemStatus::Pending);

        item.begin_dispatch(now).unwrap();
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.attempts, 1);

        item.mark_succeeded(now).unwrap();
        assert_eq!(item.status, ItemStatus::Succeeded);
    }

    #[test]
    fn test_state_machine_rejects_invalid_transitions() {
        let now = make_now();
        let mut item = OutboxItem::new(OutboxOp::Update, GenericPayload::new("jobs"), now);

        assert!(matches!(
            item.mark_succeeded(now),
            Err(OutboxError::InvalidStateTransition { .. })
        ));
        assert!(item.requeue(now).is_err());

        item.begin_dispatch(now).unwrap();
        assert!(item.begin_dispatch(now).is_err());

        item.mark_failed("boom", now).unwrap();
        assert_eq!(item.last_error.as_deref(), Some("boom"));
        item.begin_dispatch(now).unwrap();
        assert_eq!(item.attempts, 2);
    }

    #[test]
    fn test_record_failure_keeps_category() {
        let now = make_now();
        let mut item = OutboxItem::new(OutboxOp::Delete, GenericPayload::new("jobs"), now);
        item.begin_dispatch(now).unwrap();
        item.record_failure(&DispatchError::missing_handler("jobs", OutboxOp::Delete), now)
            .unwrap();

        assert!(item.is_fatal());
        assert!(item.last_error.as_deref().unwrap().starts_with("[MISSING_HANDLER]"));

        item.begin_dispatch(now).unwrap();
        item.record_failure(&DispatchError::network("offline"), now).unwrap();
        assert!(!item.is_fatal());
    }

    #[test]
    fn test_absorb_reopens_fatal_failure() {
        let now = make_now();
        let mut item = OutboxItem::new(
            OutboxOp::Update,
            GenericPayload::new("reports").with_id("s1").with_field("title", ""),
            now,
        );
        item.begin_dispatch(now).unwrap();
        item.record_failure(&DispatchError::http(422, "title required"), now)
            .unwrap();
        assert!(item.is_fatal());

        item.absorb(
            &GenericPayload::new("reports").with_id("s1").with_field("title", "fixed"),
            now.add_millis(5),
        );

        assert_eq!(item.status, ItemStatus::Pending);
        assert!(!item.is_fatal());
        assert_eq!(item.last_error, None);
        assert_eq!(item.error_category, None);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.payload.body["title"], json!("fixed"));
        assert_eq!(item.updated_at, now.add_millis(5));
    }

    #[test]
    fn test_stuck_detection() {
        let now = make_now();
        let mut item = OutboxItem::new(OutboxOp::Update, GenericPayload::new("jobs"), now);
        item.begin_dispatch(now).unwrap();

        assert!(!item.is_stuck(now.add_millis(1_000), 180_000));
        assert!(item.is_stuck(now.add_millis(180_001), 180_000));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let now = make_now();
        let item = OutboxItem::new(
            OutboxOp::Delete,
            GenericPayload::new("photos").with_client_id("c-1"),
            now,
        );
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["op"], json!("delete"));
        assert_eq!(value["status"], json!("pending"));
        assert_eq!(value["payload"]["clientId"], json!("c-1"));
        assert!(value.get("lastError").is_some());

        let archived = FailedArchiveItem {
            item,
            archived_at: now,
        };
        let value = serde_json::to_value(&archived).unwrap();
        assert_eq!(value["archivedAt"], json!(now.0));
        assert_eq!(value["op"], json!("delete"));
    }
}
