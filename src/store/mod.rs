//! Durable storage for the outbox and its auxiliary records.
//!
//! Backends only know about opaque blobs under a handful of fixed keys.
//! [`PersistedState`] layers typed JSON records on top and owns the single
//! critical section every read-modify-write of those records goes through.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Record slots the sync core persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Queue,
    Lock,
    Session,
    FailedArchive,
    /// Raw bytes of the last queue blob that failed to parse.
    Quarantine,
}

impl StoreKey {
    pub const ALL: [Self; 5] = [
        Self::Queue,
        Self::Lock,
        Self::Session,
        Self::FailedArchive,
        Self::Quarantine,
    ];

    #[must_use]
    pub const fn raw(self) -> &'static str {
        match self {
            Self::Queue => "outbox:queue",
            Self::Lock => "outbox:lock",
            Self::Session => "outbox:session",
            Self::FailedArchive => "outbox:failed_archive",
            Self::Quarantine => "outbox:quarantine",
        }
    }
}

/// Injected persistence backend.
///
/// Writes replace the whole blob for a key; there are no partial updates.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn init(&self) -> Result<(), StoreError>;
    async fn read(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write(&self, key: StoreKey, value: Vec<u8>) -> Result<(), StoreError>;
    async fn remove(&self, key: StoreKey) -> Result<(), StoreError>;
}

// ============================================================================
// Typed records
// ============================================================================

/// Typed view over a [`QueueStore`], shared by the outbox, the processor
/// and the processing lock.
pub struct PersistedState {
    store: Arc<dyn QueueStore>,
    critical: Mutex<()>,
}

impl PersistedState {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            critical: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.store.init().await
    }

    pub async fn load<T>(&self, key: StoreKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let _guard = self.critical.lock().await;
        self.load_unlocked(key).await
    }

    pub async fn save<T>(&self, key: StoreKey, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let _guard = self.critical.lock().await;
        self.save_unlocked(key, value).await
    }

    /// Load, mutate and write back one record atomically with respect to
    /// every other caller. Nothing is written when `f` fails.
    pub async fn modify<T, R, E, F>(&self, key: StoreKey, f: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default + Send + Sync,
        R: Send,
        E: From<StoreError>,
        F: FnOnce(&mut T) -> Result<R, E> + Send,
    {
        let _guard = self.critical.lock().await;
        let mut value: T = self.load_unlocked(key).await?;
        let out = f(&mut value)?;
        self.save_unlocked(key, &value).await?;
        Ok(out)
    }

    /// Hold the critical section across several records.
    pub async fn transaction(&self) -> StateTxn<'_> {
        StateTxn {
            state: self,
            _guard: self.critical.lock().await,
        }
    }

    /// Raw bytes of the last corrupt queue blob, if any.
    pub async fn quarantined(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.read(StoreKey::Quarantine).await
    }

    pub async fn clear(&self, key: StoreKey) -> Result<(), StoreError> {
        let _guard = self.critical.lock().await;
        self.store.remove(key).await
    }

    async fn load_unlocked<T>(&self, key: StoreKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let Some(bytes) = self.store.read(key).await? else {
            return Ok(T::default());
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(key = key.raw(), error = %e, "Corrupt record, resetting to empty state");
                if key == StoreKey::Queue {
                    self.store.write(StoreKey::Quarantine, bytes).await?;
                    debug!("Corrupt queue blob quarantined");
                }
                Ok(T::default())
            }
        }
    }

    async fn save_unlocked<T>(&self, key: StoreKey, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.store.write(key, bytes).await
    }
}

/// Exclusive access to every record until dropped.
pub struct StateTxn<'a> {
    state: &'a PersistedState,
    _guard: MutexGuard<'a, ()>,
}

impl StateTxn<'_> {
    pub async fn load<T>(&self, key: StoreKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        self.state.load_unlocked(key).await
    }

    pub async fn save<T>(&self, key: StoreKey, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        self.state.save_unlocked(key, value).await
    }
}
