use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{QueueStore, StoreKey};
use crate::error::StoreError;

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn write(&self, key: StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        self.records.write().await.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<(), StoreError> {
        self.records.write().await.remove(&key);
        Ok(())
    }
}
