//! src/services/object_service.rs
//!
//! ObjectService: upload and retrieval of expiring objects. Bytes go to a
//! [`BlobStore`], the descriptive record to a [`MetadataStore`]; both share
//! the identifier the blob store assigns.
//!
//! Ordering: the blob is written before its record, so the only possible
//! inconsistency is a blob without a record. The sweeper reclaims such
//! orphans from the blob's own encoded expiry.
//!
//! Reads never delete. Removing expired objects is the sweeper's job alone.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{MetadataRecord, ObjectId, StoredObject};
use crate::services::{
    blob_store::{BlobStore, ByteStream},
    clock::Clock,
    error::{StoreError, StoreResult},
    metadata::MetadataStore,
};

/// What a caller supplies alongside the content of an upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    /// Original file name, echoed back on download.
    pub file_name: String,

    /// Length declared by the client, if any. The stored length is the
    /// number of bytes actually written.
    pub declared_length: Option<u64>,

    /// How long the object stays retrievable.
    pub ttl: Duration,
}

#[derive(Clone)]
pub struct ObjectService {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl ObjectService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            clock,
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Store `content` and return the identifier it can be fetched by.
    ///
    /// If the record cannot be written the blob stays behind without
    /// metadata; the error is returned and the sweeper reclaims the blob
    /// once it expires.
    pub async fn upload(
        &self,
        content: ByteStream<'_>,
        request: UploadRequest,
    ) -> StoreResult<ObjectId> {
        let expiration = self.clock.now() + request.ttl;
        let saved = self.blobs.save(content, expiration).await?;

        if let Some(declared) = request.declared_length {
            if declared != saved.size {
                warn!(
                    id = %saved.id,
                    declared,
                    written = saved.size,
                    "declared length differs from bytes written"
                );
            }
        }

        let record = MetadataRecord::new(saved.id.clone(), request.file_name, saved.size);
        if let Err(err) = self.metadata.insert(&record).await {
            warn!(
                id = %saved.id,
                error = %err,
                "metadata insert failed; blob is orphaned until swept"
            );
            return Err(match err {
                StoreError::WriteFailure(_) => err,
                other => StoreError::write(other),
            });
        }

        debug!(id = %saved.id, length = saved.size, "object uploaded");
        Ok(saved.id)
    }

    /// Fetch a live object.
    ///
    /// Expiry is decided from the identifier before either backend is
    /// touched. A missing record or blob is `NotFound`; an incomplete object
    /// is never returned.
    pub async fn get(&self, id: &str) -> StoreResult<StoredObject> {
        let id: ObjectId = id.parse()?;
        let now = self.clock.now();
        if id.is_expired_at(now) {
            return Err(StoreError::Expired(id.to_string()));
        }

        let record = self.metadata.get(&id).await?;
        if record.is_expired_at(now) {
            return Err(StoreError::Expired(id.to_string()));
        }
        let body = self.blobs.get(&id).await?;

        Ok(StoredObject { record, body })
    }
}
