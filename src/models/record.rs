//! Metadata records and the combined object view returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::ObjectId;
use crate::services::blob_store::BlobReader;

/// Descriptive record persisted by the metadata store, keyed by `id`.
///
/// `expiration` must equal the instant encoded in `id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Shared key with the blob store.
    pub id: ObjectId,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// When this object stops being served.
    pub expiration: DateTime<Utc>,

    /// Size in bytes.
    pub length: u64,
}

impl MetadataRecord {
    pub fn new(id: ObjectId, file_name: impl Into<String>, length: u64) -> Self {
        Self {
            expiration: id.expiration(),
            id,
            file_name: file_name.into(),
            length,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// A live object: its record plus a single-pass reader over the blob.
pub struct StoredObject {
    pub record: MetadataRecord,
    pub body: BlobReader,
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredObject")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
