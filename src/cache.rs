//! Read-cache collaborator interface and the freshness rule shared by the
//! prefetch orchestrator and the warm pipeline.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, UnixTimeMs};
use crate::error::FetchError;

/// Structured cache key, e.g. `["items", "42"]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// List key for an entity, scoped by parent job when known.
    #[must_use]
    pub fn list(entity: &str, scope: Option<&str>) -> Self {
        let mut parts = vec![entity.to_string()];
        parts.extend(scope.map(str::to_string));
        Self(parts)
    }

    #[must_use]
    pub fn detail(entity: &str, id: &str) -> Self {
        Self(vec![entity.to_string(), "detail".to_string(), id.to_string()])
    }

    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` is `other` or one of its ancestors.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntry {
    pub data: Value,
    pub updated_at: UnixTimeMs,
    /// Set by invalidation; the data stays readable but is refetched.
    #[serde(default)]
    pub invalidated: bool,
}

/// Remote fetch producing a cache value. Called at most once per scheduled task.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Freshness rule.
///
/// * `force` or no entry: fetch.
/// * invalidated entry: fetch.
/// * entry with a TTL: fetch once `now - updated_at` exceeds it.
/// * entry without a TTL: fresh until invalidated.
#[must_use]
pub fn needs_fetch(
    entry: Option<&CachedEntry>,
    ttl: Option<Duration>,
    force: bool,
    now: UnixTimeMs,
) -> bool {
    if force {
        return true;
    }
    let Some(entry) = entry else {
        return true;
    };
    if entry.invalidated {
        return true;
    }
    match ttl {
        Some(ttl) => {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            now.elapsed_since(entry.updated_at) > ttl_ms
        }
        None => false,
    }
}

/// Local read cache owned by the host app.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get_state(&self, key: &QueryKey) -> Option<CachedEntry>;

    async fn set_state(&self, key: &QueryKey, data: Value);

    /// Mark `key` and every key below it as stale.
    async fn invalidate(&self, key: &QueryKey);

    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }

    /// Fetch and store `key` unless the cached entry is still fresh.
    /// Returns whether a fetch happened.
    async fn prefetch(
        &self,
        key: &QueryKey,
        fetch: &FetchFn,
        stale_time: Option<Duration>,
    ) -> Result<bool, FetchError> {
        let entry = self.get_state(key).await;
        if !needs_fetch(entry.as_ref(), stale_time, false, self.now()) {
            return Ok(false);
        }
        let data = fetch().await?;
        self.set_state(key, data).await;
        Ok(true)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// LRU-bounded [`QueryCache`].
pub struct MemoryQueryCache {
    entries: Mutex<LruCache<QueryKey, CachedEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueryCache {
    pub const DEFAULT_CAPACITY: usize = 1_000;

    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl QueryCache for MemoryQueryCache {
    async fn get_state(&self, key: &QueryKey) -> Option<CachedEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn set_state(&self, key: &QueryKey, data: Value) {
        let entry = CachedEntry {
            data,
            updated_at: self.clock.now(),
            invalidated: false,
        };
        self.entries.lock().await.put(key.clone(), entry);
    }

    async fn invalidate(&self, key: &QueryKey) {
        let mut entries = self.entries.lock().await;
        let mut marked = 0usize;
        for (k, entry) in entries.iter_mut() {
            if key.is_prefix_of(k) {
                entry.invalidated = true;
                marked += 1;
            }
        }
        debug!(key = %key, marked, "Invalidated cache entries");
    }

    fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }
}
