use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{fetch_fn, FetchFn, QueryKey};
use crate::error::{DispatchError, ErrorCategory, FetchError};
use crate::model::{GenericPayload, OutboxOp};

/// Options forwarded to an entity's `list` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scope: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ListOptions {
    pub fn scoped(parent_scope: impl Into<String>) -> Self {
        Self {
            parent_scope: Some(parent_scope.into()),
            params: Map::new(),
        }
    }
}

/// Remote operations for one entity type. Every operation is optional;
/// the defaults report a missing handler.
#[async_trait]
pub trait EntityService: Send + Sync {
    async fn create(&self, payload: &GenericPayload) -> Result<Value, DispatchError> {
        Err(DispatchError::missing_handler(&payload.entity, OutboxOp::Create))
    }

    async fn update(&self, payload: &GenericPayload) -> Result<Value, DispatchError> {
        Err(DispatchError::missing_handler(&payload.entity, OutboxOp::Update))
    }

    async fn delete(&self, payload: &GenericPayload) -> Result<Value, DispatchError> {
        Err(DispatchError::missing_handler(&payload.entity, OutboxOp::Delete))
    }

    async fn list(&self, _opts: &ListOptions) -> Result<Vec<Value>, DispatchError> {
        Err(DispatchError::new(
            ErrorCategory::MissingHandler,
            "no list handler registered",
        ))
    }

    /// Read-cache keys made stale by a successful mutation.
    fn cache_keys(&self, payload: &GenericPayload) -> Vec<QueryKey> {
        default_cache_keys(payload)
    }
}

/// List key scoped by the parent job, plus the detail key once a server id
/// is known.
#[must_use]
pub fn default_cache_keys(payload: &GenericPayload) -> Vec<QueryKey> {
    let scope = payload.parent_scope();
    let mut keys = vec![QueryKey::list(&payload.entity, scope.as_deref())];
    if let Some(id) = &payload.id {
        keys.push(QueryKey::detail(&payload.entity, id));
    }
    keys
}

/// Server id carried by a create/update result, as a string.
#[must_use]
pub fn server_id_of(result: &Value) -> Option<String> {
    match result.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone, Default)]
pub struct EntityRegistry {
    services: HashMap<String, Arc<dyn EntityService>>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, entity: impl Into<String>, service: Arc<dyn EntityService>) -> Self {
        self.register(entity, service);
        self
    }

    pub fn register(&mut self, entity: impl Into<String>, service: Arc<dyn EntityService>) {
        let entity = entity.into();
        debug!(entity = %entity, "Registered entity service");
        self.services.insert(entity, service);
    }

    #[must_use]
    pub fn contains(&self, entity: &str) -> bool {
        self.services.contains_key(entity)
    }

    #[must_use]
    pub fn get(&self, entity: &str) -> Option<&Arc<dyn EntityService>> {
        self.services.get(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub async fn dispatch(
        &self,
        op: OutboxOp,
        payload: &GenericPayload,
    ) -> Result<Value, DispatchError> {
        let service = self
            .get(&payload.entity)
            .ok_or_else(|| DispatchError::unknown_entity(&payload.entity))?;
        match op {
            OutboxOp::Create => service.create(payload).await,
            OutboxOp::Update => service.update(payload).await,
            OutboxOp::Delete => service.delete(payload).await,
        }
    }

    pub async fn list(
        &self,
        entity: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Value>, DispatchError> {
        let service = self
            .get(entity)
            .ok_or_else(|| DispatchError::unknown_entity(entity))?;
        service.list(opts).await
    }

    #[must_use]
    pub fn cache_keys(&self, payload: &GenericPayload) -> Vec<QueryKey> {
        self.get(&payload.entity)
            .map_or_else(|| default_cache_keys(payload), |s| s.cache_keys(payload))
    }

    /// Fetch function that lists `entity` for use in prefetch jobs.
    #[must_use]
    pub fn list_fetch(&self, entity: &str, opts: ListOptions) -> FetchFn {
        let service = self.get(entity).cloned();
        let entity = entity.to_string();
        fetch_fn(move || {
            let service = service.clone();
            let entity = entity.clone();
            let opts = opts.clone();
            async move {
                let service = service.ok_or_else(|| {
                    FetchError::from(DispatchError::unknown_entity(&entity))
                })?;
                let rows = service.list(&opts).await?;
                Ok::<_, FetchError>(Value::Array(rows))
            }
        })
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<_> = self.entities().collect();
        entities.sort_unstable();
        f.debug_struct("EntityRegistry")
            .field("entities", &entities)
            .finish()
    }
}
