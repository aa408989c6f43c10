//! Background reclamation of expired objects.
//!
//! Each cycle walks the blob namespace, decodes the expiration from every
//! key and deletes both the blob and its record once expired. A second pass
//! over the metadata namespace picks up records whose blob is already gone;
//! it is skipped for backends that evict expired records themselves.
//!
//! Each cycle also removes temp files that unfinished writes left behind,
//! once they are older than the partial grace period.
//!
//! Per-item failures are logged and retried on the next cycle. Failing to
//! enumerate a namespace at all ends the loop with an error.

use futures::TryStreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::models::ObjectId;
use crate::services::{
    blob_store::BlobStore,
    clock::Clock,
    error::{StoreError, StoreResult},
    metadata::MetadataStore,
};

/// Default time between sweep cycles.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default age after which an unfinished temp file is considered abandoned.
pub const DEFAULT_PARTIAL_GRACE: Duration = Duration::from_secs(60 * 60);

/// Counters for one sweep cycle, summed over both passes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys examined.
    pub scanned: usize,
    /// Keys not yet due.
    pub live: usize,
    /// Keys that do not parse as identifiers; left in place.
    pub malformed: usize,
    /// Expired objects whose deletions all succeeded.
    pub reclaimed: usize,
    /// Expired objects with at least one failed deletion.
    pub failed: usize,
    /// Abandoned temp files removed.
    pub partials: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pass {
    Blobs,
    Metadata,
}

pub struct Sweeper {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    partial_grace: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Sweeper {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            clock,
            interval,
            partial_grace: DEFAULT_PARTIAL_GRACE,
            shutdown_rx,
        }
    }

    /// Set how old a temp file must be before it is removed.
    pub fn with_partial_grace(mut self, grace: Duration) -> Self {
        self.partial_grace = grace;
        self
    }

    /// Sweep immediately, then once per interval, until shutdown is
    /// signalled (or its sender dropped) or enumeration fails.
    pub async fn run(&mut self) -> StoreResult<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            metadata_backend = self.metadata.backend_name(),
            "sweeper starting"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("sweeper received shutdown signal");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) => info!(
                            scanned = report.scanned,
                            live = report.live,
                            malformed = report.malformed,
                            reclaimed = report.reclaimed,
                            failed = report.failed,
                            partials = report.partials,
                            "sweep finished, sleeping until next cycle"
                        ),
                        Err(err) => {
                            error!(error = %err, "could not enumerate storage; sweeper stopping");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Run one full cycle over both namespaces.
    pub async fn sweep_once(&self) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        let mut blob_ids = self.blobs.ids();
        while let Some(raw) = blob_ids.try_next().await? {
            self.examine(&raw, Pass::Blobs, &mut report).await;
        }
        drop(blob_ids);

        if !self.metadata.expires_natively() {
            let mut record_ids = self.metadata.ids();
            while let Some(raw) = record_ids.try_next().await? {
                self.examine(&raw, Pass::Metadata, &mut report).await;
            }
        }

        report.partials += match self.blobs.reclaim_partials(self.partial_grace).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, resource = "blob", "could not reclaim temp files");
                0
            }
        };
        report.partials += match self.metadata.reclaim_partials(self.partial_grace).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, resource = "metadata", "could not reclaim temp files");
                0
            }
        };

        Ok(report)
    }

    async fn examine(&self, raw: &str, pass: Pass, report: &mut SweepReport) {
        report.scanned += 1;

        let id: ObjectId = match raw.parse() {
            Ok(id) => id,
            Err(err) => {
                warn!(id = raw, error = %err, ?pass, "skipping malformed identifier");
                report.malformed += 1;
                return;
            }
        };

        if !id.is_expired_at(self.clock.now()) {
            debug!(id = %id, expiration = %id.expiration(), "skipping live object");
            report.live += 1;
            return;
        }

        info!(id = %id, expiration = %id.expiration(), ?pass, "object expired");

        // The two deletions are independent: one failing never blocks the other.
        let blob = match pass {
            Pass::Blobs => Outcome::of(self.blobs.delete(&id).await, &id, "blob"),
            Pass::Metadata => Outcome::Done,
        };
        let record = Outcome::of(self.metadata.delete(&id).await, &id, "metadata");

        match (blob, record) {
            (Outcome::Done, Outcome::Done) => {
                info!(id = %id, "object reclaimed");
                report.reclaimed += 1;
            }
            (Outcome::Failed, _) | (_, Outcome::Failed) => report.failed += 1,
            _ => report.live += 1,
        }
    }
}

enum Outcome {
    Done,
    NotDue,
    Failed,
}

impl Outcome {
    fn of(result: StoreResult<()>, id: &ObjectId, resource: &'static str) -> Self {
        match result {
            Ok(()) => Outcome::Done,
            Err(StoreError::NotExpired(_)) => {
                debug!(id = %id, resource, "backend reports not yet expired, skipping");
                Outcome::NotDue
            }
            Err(err) => {
                warn!(id = %id, resource, error = %err, "failed deleting expired object");
                Outcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataRecord;
    use crate::services::{
        blob_store::{BlobReader, ByteStream, FsBlobStore, SavedBlob},
        clock::ManualClock,
        metadata::{FileMetadataStore, MemoryMetadataStore},
        object_service::{ObjectService, UploadRequest},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use futures::{StreamExt, stream::BoxStream};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        clock: ManualClock,
        blobs: Arc<FsBlobStore>,
        metadata: Arc<FileMetadataStore>,
        service: ObjectService,
        _shutdown_tx: mpsc::Sender<()>,
        sweeper: Sweeper,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc::now());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let blobs = Arc::new(
            FsBlobStore::new(dir.path().join("blobs"), shared.clone())
                .await
                .unwrap(),
        );
        let metadata = Arc::new(
            FileMetadataStore::new(dir.path().join("meta"), shared.clone())
                .await
                .unwrap(),
        );
        let service = ObjectService::new(blobs.clone(), metadata.clone(), shared.clone());
        let (tx, rx) = mpsc::channel(1);
        let sweeper = Sweeper::new(
            blobs.clone(),
            metadata.clone(),
            shared,
            DEFAULT_SWEEP_INTERVAL,
            rx,
        );
        Harness {
            dir,
            clock,
            blobs,
            metadata,
            service,
            _shutdown_tx: tx,
            sweeper,
        }
    }

    fn body(bytes: &'static [u8]) -> ByteStream<'static> {
        futures::stream::once(async move { Ok(Bytes::from_static(bytes)) }).boxed()
    }

    async fn upload(service: &ObjectService, content: &'static [u8], ttl: ChronoDuration) -> ObjectId {
        service
            .upload(
                body(content),
                UploadRequest {
                    file_name: "f.bin".into(),
                    declared_length: None,
                    ttl,
                },
            )
            .await
            .unwrap()
    }

    async fn blob_ids(h: &Harness) -> Vec<String> {
        h.blobs.ids().try_collect().await.unwrap()
    }

    async fn record_ids(h: &Harness) -> Vec<String> {
        h.metadata.ids().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn one_cycle_reclaims_every_expired_object() {
        let h = harness().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(upload(&h.service, b"expiring", ChronoDuration::seconds(30)).await);
        }
        h.clock.advance(ChronoDuration::minutes(1));

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.reclaimed, 5);
        assert_eq!(report.failed, 0);
        for id in &ids {
            assert!(h.service.get(id.as_str()).await.unwrap_err().is_gone());
        }
        assert!(blob_ids(&h).await.is_empty());
        assert!(record_ids(&h).await.is_empty());
    }

    #[tokio::test]
    async fn live_objects_survive_a_sweep() {
        let h = harness().await;
        let live = upload(&h.service, b"keep", ChronoDuration::hours(1)).await;
        let due = upload(&h.service, b"drop", ChronoDuration::seconds(1)).await;
        h.clock.advance(ChronoDuration::seconds(1));

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.reclaimed, 1);
        assert_eq!(blob_ids(&h).await, vec![live.to_string()]);
        assert!(h.service.get(live.as_str()).await.is_ok());
        assert!(h.service.get(due.as_str()).await.is_err());
    }

    #[tokio::test]
    async fn one_second_upload_lifecycle() {
        let h = harness().await;
        let id = upload(&h.service, b"0123456789", ChronoDuration::seconds(1)).await;
        assert!(h.service.get(id.as_str()).await.is_ok());

        h.clock.advance(ChronoDuration::seconds(2));
        assert!(h.service.get(id.as_str()).await.unwrap_err().is_gone());

        h.sweeper.sweep_once().await.unwrap();
        assert!(!blob_ids(&h).await.contains(&id.to_string()));
        assert!(!record_ids(&h).await.contains(&id.to_string()));
    }

    #[tokio::test]
    async fn malformed_entries_are_left_alone() {
        let h = harness().await;
        let stray = h.blobs.root().join("not-an-id");
        std::fs::write(&stray, b"?").unwrap();
        h.clock.advance(ChronoDuration::days(365));

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.malformed, 1);
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn orphaned_blob_is_reclaimed_by_its_own_expiry() {
        let h = harness().await;
        let saved = h
            .blobs
            .save(body(b"orphan"), h.clock.now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        h.clock.advance(ChronoDuration::seconds(1));

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.reclaimed, 1);
        assert!(!blob_ids(&h).await.contains(&saved.id.to_string()));
    }

    #[tokio::test]
    async fn record_without_blob_is_reclaimed_in_metadata_pass() {
        let h = harness().await;
        let id = ObjectId::generate(h.clock.now() + ChronoDuration::seconds(1));
        h.metadata
            .insert(&MetadataRecord::new(id.clone(), "ghost", 1))
            .await
            .unwrap();
        h.clock.advance(ChronoDuration::seconds(1));

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.reclaimed, 1);
        assert!(record_ids(&h).await.is_empty());
    }

    #[tokio::test]
    async fn sweeping_twice_is_harmless() {
        let h = harness().await;
        upload(&h.service, b"x", ChronoDuration::seconds(1)).await;
        h.clock.advance(ChronoDuration::seconds(5));

        let first = h.sweeper.sweep_once().await.unwrap();
        let second = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(first.reclaimed, 1);
        assert_eq!(second, SweepReport::default());
    }

    /// Blob store whose deletions always fail but which otherwise delegates.
    struct StuckBlobs(Arc<FsBlobStore>);

    #[async_trait]
    impl BlobStore for StuckBlobs {
        async fn save(
            &self,
            content: ByteStream<'_>,
            expiration: DateTime<Utc>,
        ) -> StoreResult<SavedBlob> {
            self.0.save(content, expiration).await
        }
        async fn get(&self, id: &ObjectId) -> StoreResult<BlobReader> {
            self.0.get(id).await
        }
        async fn delete(&self, _id: &ObjectId) -> StoreResult<()> {
            Err(StoreError::Io(std::io::Error::other("device busy")))
        }
        fn ids(&self) -> BoxStream<'_, StoreResult<String>> {
            self.0.ids()
        }
        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stuck_blob_does_not_block_metadata_or_other_items() {
        let h = harness().await;
        let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
        let metadata = Arc::new(MemoryMetadataStore::new(clock.clone()));
        let stuck = Arc::new(StuckBlobs(h.blobs.clone()));
        let service = ObjectService::new(stuck.clone(), metadata.clone(), clock.clone());
        let (_tx, rx) = mpsc::channel(1);
        let sweeper = Sweeper::new(stuck, metadata.clone(), clock, DEFAULT_SWEEP_INTERVAL, rx);

        upload(&service, b"a", ChronoDuration::seconds(1)).await;
        upload(&service, b"b", ChronoDuration::seconds(1)).await;
        h.clock.advance(ChronoDuration::seconds(1));

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(metadata.len().await, 0);
        assert_eq!(blob_ids(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn abandoned_writes_leave_nothing_after_a_sweep() {
        let h = harness().await;
        let stalled: ByteStream<'static> =
            futures::stream::once(async { Ok(Bytes::from_static(b"partial")) })
                .chain(futures::stream::pending())
                .boxed();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            h.blobs.save(stalled, h.clock.now() + ChronoDuration::minutes(1)),
        )
        .await;
        assert!(cancelled.is_err());

        // Left behind by a process that died mid-write.
        std::fs::write(h.blobs.root().join(".crashed.part"), b"half").unwrap();
        std::fs::write(h.dir.path().join("meta").join(".crashed.part"), b"{").unwrap();

        let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
        let (_tx, rx) = mpsc::channel(1);
        let sweeper = Sweeper::new(h.blobs.clone(), h.metadata.clone(), clock, DEFAULT_SWEEP_INTERVAL, rx)
            .with_partial_grace(Duration::ZERO);

        let report = sweeper.sweep_once().await.unwrap();

        assert_eq!(report.partials, 2);
        assert!(std::fs::read_dir(h.blobs.root()).unwrap().next().is_none());
        assert!(std::fs::read_dir(h.dir.path().join("meta")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn recent_temp_files_survive_the_default_grace() {
        let h = harness().await;
        let in_flight = h.blobs.root().join(".in-flight.part");
        std::fs::write(&in_flight, b"half").unwrap();

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report.partials, 0);
        assert!(in_flight.exists());
    }

    #[tokio::test]
    async fn enumeration_failure_is_fatal() {
        let mut h = harness().await;
        std::fs::remove_dir_all(h.blobs.root()).unwrap();

        assert!(h.sweeper.sweep_once().await.is_err());
        assert!(h.sweeper.run().await.is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness().await;
        let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
        let (tx, rx) = mpsc::channel(1);
        let mut sweeper = Sweeper::new(
            h.blobs.clone(),
            h.metadata.clone(),
            clock,
            Duration::from_millis(10),
            rx,
        );

        let task = tokio::spawn(async move { sweeper.run().await });
        tx.send(()).await.unwrap();

        assert!(task.await.unwrap().is_ok());
    }
}
