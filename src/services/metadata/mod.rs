//! Metadata storage: one small record per object, keyed by [`ObjectId`].
//!
//! Every backend satisfies the same contract:
//! - `insert` overwrites any record with the same key.
//! - `get` fails with `NotFound` when the record is absent or was evicted.
//! - `delete` succeeds on an already-missing record, and refuses with
//!   `NotExpired` before the record's expiration unless the backend evicts
//!   expired keys on its own.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::models::{MetadataRecord, ObjectId};
use crate::services::error::StoreResult;

pub mod files;
pub mod memory;
pub mod redis;
pub mod sqlite;

pub use files::FileMetadataStore;
pub use memory::MemoryMetadataStore;
pub use redis::{RedisConfig, RedisMetadataStore};
pub use sqlite::SqliteMetadataStore;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, record: &MetadataRecord) -> StoreResult<()>;

    async fn get(&self, id: &ObjectId) -> StoreResult<MetadataRecord>;

    async fn delete(&self, id: &ObjectId) -> StoreResult<()>;

    /// Lazily enumerate stored keys, a page at a time where the backend
    /// supports it.
    fn ids(&self) -> BoxStream<'_, StoreResult<String>>;

    /// Whether the backend evicts records at their expiration by itself.
    /// The sweeper skips its metadata pass for such backends.
    fn expires_natively(&self) -> bool {
        false
    }

    /// Short name used in logs and readiness output.
    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> StoreResult<()>;

    /// Remove temp files of record writes that never finished, if the backend
    /// has any. See [`BlobStore::reclaim_partials`].
    ///
    /// [`BlobStore::reclaim_partials`]: crate::services::blob_store::BlobStore::reclaim_partials
    async fn reclaim_partials(&self, _older_than: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}
