//! In-process metadata store for tests and single-node development.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

use super::MetadataStore;
use crate::models::{MetadataRecord, ObjectId};
use crate::services::{
    clock::Clock,
    error::{StoreError, StoreResult},
};

/// Records live in an explicitly owned map behind one mutex; each instance is
/// independent.
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<ObjectId, MetadataRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryMetadataStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(&self, record: &MetadataRecord) -> StoreResult<()> {
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> StoreResult<MetadataRecord> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        match records.get(id) {
            None => Ok(()),
            Some(record) if !record.is_expired_at(self.clock.now()) => {
                Err(StoreError::NotExpired(id.to_string()))
            }
            Some(_) => {
                records.remove(id);
                Ok(())
            }
        }
    }

    /// Snapshot of the keys at call time.
    fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
        stream::once(async move {
            let keys: Vec<StoreResult<String>> = self
                .records
                .lock()
                .await
                .keys()
                .map(|id| Ok(id.to_string()))
                .collect();
            stream::iter(keys)
        })
        .flatten()
        .boxed()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
