//! One JSON document per record, stored as `{dir}/{id}.json`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::debug;

use super::MetadataStore;
use crate::models::{MetadataRecord, ObjectId};
use crate::services::{
    blob_store::{PartialFile, list_dir, remove_stale_partials},
    clock::Clock,
    error::{StoreError, StoreResult},
};

const EXTENSION: &str = ".json";

#[derive(Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileMetadataStore {
    pub async fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                "metadata path is required",
            )));
        }
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, clock })
    }

    fn record_path(&self, id: &ObjectId) -> PathBuf {
        self.dir.join(format!("{id}{EXTENSION}"))
    }

    /// Read a record, mapping a missing file to `Ok(None)`.
    async fn read(&self, id: &ObjectId) -> StoreResult<Option<MetadataRecord>> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn insert(&self, record: &MetadataRecord) -> StoreResult<()> {
        let content = serde_json::to_vec(record).map_err(StoreError::write)?;

        // Write-then-rename so readers never see a half-written record.
        let partial = PartialFile::new(&self.dir);
        fs::write(partial.path(), &content)
            .await
            .map_err(StoreError::write)?;
        partial
            .persist(&self.record_path(&record.id))
            .await
            .map_err(StoreError::write)
    }

    async fn get(&self, id: &ObjectId) -> StoreResult<MetadataRecord> {
        self.read(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        let Some(record) = self.read(id).await? else {
            debug!(id = %id, "metadata already missing");
            return Ok(());
        };
        if !record.is_expired_at(self.clock.now()) {
            return Err(StoreError::NotExpired(id.to_string()));
        }

        match fs::remove_file(self.record_path(id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
        list_dir(self.dir.clone(), |name| {
            if name.starts_with('.') {
                return None;
            }
            name.strip_suffix(EXTENSION).map(str::to_string)
        })
    }

    fn backend_name(&self) -> &'static str {
        "files"
    }

    async fn health_check(&self) -> StoreResult<()> {
        fs::metadata(&self.dir).await?;
        Ok(())
    }

    async fn reclaim_partials(&self, older_than: Duration) -> StoreResult<usize> {
        remove_stale_partials(&self.dir, older_than).await
    }
}
