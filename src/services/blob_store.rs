//! src/services/blob_store.rs
//!
//! Blob storage: raw uploaded bytes keyed by [`ObjectId`]. The filesystem
//! backend keeps one flat file per identifier beneath `root/{id}`, with no
//! wrapping format.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::ObjectId;
use crate::services::{
    clock::Clock,
    error::{StoreError, StoreResult},
};

/// Suffix of in-flight temp files. Their names also start with a dot so
/// enumeration never reports them.
const PARTIAL_SUFFIX: &str = ".part";

/// Finite, single-pass reader over a stored blob.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Incoming upload content.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Outcome of a successful [`BlobStore::save`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedBlob {
    pub id: ObjectId,
    /// Bytes actually written.
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `content` under a freshly generated identifier.
    ///
    /// Returns only once every byte is durably written; on failure nothing
    /// is left under the identifier.
    async fn save(&self, content: ByteStream<'_>, expiration: DateTime<Utc>)
    -> StoreResult<SavedBlob>;

    /// Open a blob for streaming. `NotFound` if absent.
    async fn get(&self, id: &ObjectId) -> StoreResult<BlobReader>;

    /// Remove a blob. An already-missing blob is not an error.
    async fn delete(&self, id: &ObjectId) -> StoreResult<()>;

    /// Lazily enumerate stored keys. Keys are raw so callers can report
    /// malformed entries instead of losing them.
    fn ids(&self) -> BoxStream<'_, StoreResult<String>>;

    async fn health_check(&self) -> StoreResult<()>;

    /// Remove temp files left by writes that never finished and were last
    /// touched more than `older_than` ago. Returns how many were removed.
    async fn reclaim_partials(&self, _older_than: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}

/// Blob store backed by a local directory.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsBlobStore {
    /// Open (creating if needed) the blob directory at `root`.
    pub async fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                "blob storage path is required",
            )));
        }
        fs::create_dir_all(&root).await?;
        Ok(Self { root, clock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(
        &self,
        content: ByteStream<'_>,
        expiration: DateTime<Utc>,
    ) -> StoreResult<SavedBlob> {
        let id = ObjectId::generate(expiration);
        let partial = PartialFile::new(&self.root);

        let size = write_stream(partial.path(), content)
            .await
            .map_err(StoreError::write)?;
        partial
            .persist(&self.blob_path(&id))
            .await
            .map_err(StoreError::write)?;

        debug!(id = %id, size, "blob saved");
        Ok(SavedBlob { id, size })
    }

    async fn get(&self, id: &ObjectId) -> StoreResult<BlobReader> {
        let file = File::open(self.blob_path(id)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        if !id.is_expired_at(self.clock.now()) {
            return Err(StoreError::NotExpired(id.to_string()));
        }

        let path = self.blob_path(id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        Ok(())
    }

    fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
        list_dir(self.root.clone(), |name| {
            (!name.starts_with('.')).then(|| name.to_string())
        })
    }

    /// Best-effort write/read/delete of a probe file under the root.
    async fn health_check(&self) -> StoreResult<()> {
        let probe = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let bytes = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;

        if bytes? == b"readyz" {
            Ok(())
        } else {
            Err(StoreError::Io(io::Error::other("probe file content mismatch")))
        }
    }

    async fn reclaim_partials(&self, older_than: Duration) -> StoreResult<usize> {
        remove_stale_partials(&self.root, older_than).await
    }
}

/// A temp file that is removed when dropped, unless [`persist`] moved it
/// into place first. Dropping an in-flight write therefore cleans up too.
///
/// [`persist`]: PartialFile::persist
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!(".{}{PARTIAL_SUFFIX}", Uuid::new_v4())),
            armed: true,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Rename the temp file to `target`.
    pub(crate) async fn persist(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed unfinished {}", self.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(error = %err, "could not remove {}", self.path.display()),
            }
        }
    }
}

/// Delete temp files directly under `dir` whose last modification is at
/// least `older_than` in the past.
///
/// These only remain after a crash; a failure on one file is logged and the
/// rest are still examined.
pub(crate) async fn remove_stale_partials(dir: &Path, older_than: Duration) -> StoreResult<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }

        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!(file = name, error = %err, "could not stat temp file");
                continue;
            }
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(file = name, age_secs = age.as_secs(), "removed stale temp file");
                removed += 1;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(file = name, error = %err, "could not remove stale temp file"),
        }
    }

    Ok(removed)
}

/// Stream `content` into a new file at `path`, fsync it and return its size.
async fn write_stream(path: &Path, mut content: ByteStream<'_>) -> io::Result<u64> {
    let mut file = File::create(path).await?;
    let mut size: u64 = 0;
    while let Some(chunk) = content.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

/// Lazily stream the entries of `dir`, keeping the names `keep` maps to a key.
///
/// Failing to open the directory surfaces as the first item.
pub(crate) fn list_dir<F>(dir: PathBuf, keep: F) -> BoxStream<'static, StoreResult<String>>
where
    F: Fn(&str) -> Option<String> + Send + Sync + Copy + 'static,
{
    futures::stream::once(fs::read_dir(dir))
        .map_ok(|entries| {
            futures::stream::try_unfold(entries, |mut entries| async move {
                Ok::<_, io::Error>(entries.next_entry().await?.map(|entry| (entry, entries)))
            })
        })
        .try_flatten()
        .try_filter_map(move |entry| async move {
            Ok::<_, io::Error>(entry.file_name().to_str().and_then(keep))
        })
        .map_err(StoreError::from)
        .boxed()
}
