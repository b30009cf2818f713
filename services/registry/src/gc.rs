//! Background cleanup: idle upload sessions and unreferenced blobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use storage::StorageBucket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::metadata::MetadataStore;
use crate::metadata::models::BlobRow;
use crate::upload::{UploadManager, blob_lock};

const COLLECT_BATCH: u32 = 100;

/// Deletes blobs which no artifact has referenced for a grace period.
///
/// Each blob is handled under its named lock, the same one upload promotion
/// takes. The row goes first, and only while it is still unreferenced and
/// idle, so a blob that gains a reference or is pushed again between listing
/// and deletion is kept.
#[derive(Debug, Clone)]
pub struct BlobCollector {
    blobs: StorageBucket,
    metadata: MetadataStore,
    grace: Duration,
}

impl BlobCollector {
    /// Collect blobs in `blobs` once unreferenced and idle for `grace`.
    pub fn new(blobs: StorageBucket, metadata: MetadataStore, grace: Duration) -> Self {
        Self {
            blobs,
            metadata,
            grace,
        }
    }

    /// Run one collection pass, returning the number of blobs removed.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) -> RegistryResult<usize> {
        let Some(before) = chrono::Duration::from_std(self.grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(0);
        };

        let candidates = {
            let mut conn = self.metadata.connection().await?;
            self.metadata
                .blobs()
                .list_unreferenced(&mut conn, before, COLLECT_BATCH)
                .await?
        };

        let mut removed = 0;
        for blob in candidates {
            let digest: Digest = match blob.digest.parse() {
                Ok(digest) => digest,
                Err(error) => {
                    tracing::warn!(digest = %blob.digest, %error, "skipping blob with unreadable digest");
                    continue;
                }
            };

            let guard = match self.metadata.locker().lock(&blob_lock(&digest)).await {
                Ok(guard) => guard,
                Err(error) => {
                    tracing::debug!(%digest, %error, "blob busy, skipped");
                    continue;
                }
            };
            let result = self.remove(&blob, &digest, before).await;
            if let Err(error) = guard.release().await {
                tracing::warn!(%digest, %error, "failed to release blob lock");
            }
            if result? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove(&self, blob: &BlobRow, digest: &Digest, before: DateTime<Utc>) -> RegistryResult<bool> {
        let deleted = {
            let mut conn = self.metadata.connection().await?;
            self.metadata
                .blobs()
                .delete_unreferenced(&mut conn, blob.id, before)
                .await?
        };
        if !deleted {
            tracing::debug!(%digest, "blob referenced or pushed again, kept");
            return Ok(false);
        }

        if let Err(error) = self.blobs.delete(&digest.blob_path()).await {
            tracing::warn!(%digest, %error, "blob row removed but object delete failed");
            return Ok(false);
        }
        tracing::info!(%digest, size = blob.size, "blob collected");
        Ok(true)
    }
}

/// Periodically aborts upload sessions idle for longer than the TTL, and
/// optionally collects unreferenced blobs on the same schedule.
#[derive(Debug)]
pub struct UploadSweeper {
    uploads: UploadManager,
    ttl: Duration,
    interval: Duration,
    collector: Option<BlobCollector>,
}

impl UploadSweeper {
    /// Sweep sessions idle for `ttl`, every `interval`.
    pub fn new(uploads: UploadManager, ttl: Duration, interval: Duration) -> Self {
        Self {
            uploads,
            ttl,
            interval: interval.max(Duration::from_secs(1)),
            collector: None,
        }
    }

    /// Also collect unreferenced blobs on every tick.
    pub fn with_collector(mut self, collector: BlobCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Run in a background task until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Sweep on every tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::debug!("sweeper stopped");
    }

    async fn tick(&self) {
        match self.uploads.sweep(self.ttl).await {
            Ok(0) => {}
            Ok(swept) => tracing::info!(swept, "idle upload sessions swept"),
            Err(error) => tracing::warn!(%error, "upload sweep failed"),
        }

        if let Some(collector) = &self.collector {
            match collector.collect().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "unreferenced blobs collected"),
                Err(error) => tracing::warn!(%error, "blob collection failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::config::{DatabaseConfig, LockerConfig};
    use crate::reference::RepositoryName;

    async fn fixture() -> (StorageBucket, MetadataStore) {
        let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
        let bucket = storage.bucket("registry");
        let metadata = MetadataStore::in_memory().await.unwrap();
        (bucket, metadata)
    }

    #[tokio::test]
    async fn collector_removes_idle_unreferenced_blobs() {
        let (bucket, metadata) = fixture().await;
        let uploads = UploadManager::new(bucket.clone(), metadata.clone());
        let repository = RepositoryName::parse("lib/app").unwrap();
        let digest = Digest::sha256(b"hello");
        uploads
            .upload_monolithic(&repository, &digest, &b"hello"[..])
            .await
            .unwrap();
        assert!(bucket.exists(&digest.blob_path()).await.unwrap());

        // still inside the grace period
        let patient = BlobCollector::new(bucket.clone(), metadata.clone(), Duration::from_secs(3600));
        assert_eq!(patient.collect().await.unwrap(), 0);

        let eager = BlobCollector::new(bucket.clone(), metadata.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(eager.collect().await.unwrap(), 1);
        assert!(!bucket.exists(&digest.blob_path()).await.unwrap());

        let mut conn = metadata.connection().await.unwrap();
        assert!(!metadata.blobs().exists(&mut conn, &digest.to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn repushed_blob_survives_collection() {
        let (bucket, metadata) = fixture().await;
        let uploads = UploadManager::new(bucket.clone(), metadata.clone());
        let repository = RepositoryName::parse("lib/app").unwrap();
        let digest = Digest::sha256(b"hello");
        uploads
            .upload_monolithic(&repository, &digest, &b"hello"[..])
            .await
            .unwrap();

        {
            let mut conn = metadata.connection().await.unwrap();
            sqlx::query("UPDATE blobs SET pushed_at = ?, last_pull = ? WHERE digest = ?")
                .bind(Utc::now() - chrono::Duration::days(30))
                .bind(Utc::now() - chrono::Duration::days(20))
                .bind(digest.to_string())
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        uploads
            .upload_monolithic(&repository, &digest, &b"hello"[..])
            .await
            .unwrap();

        let collector = BlobCollector::new(
            bucket.clone(),
            metadata.clone(),
            Duration::from_secs(7 * 24 * 60 * 60),
        );
        assert_eq!(collector.collect().await.unwrap(), 0);
        assert!(bucket.exists(&digest.blob_path()).await.unwrap());
        assert!(uploads.mount(&digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn locked_blob_is_skipped() {
        let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
        let bucket = storage.bucket("registry");
        let metadata = MetadataStore::connect(
            &DatabaseConfig::default(),
            LockerConfig {
                attempts: 1,
                backoff_ms: 1,
            },
        )
        .await
        .unwrap();
        let uploads = UploadManager::new(bucket.clone(), metadata.clone());
        let digest = Digest::sha256(b"hello");
        uploads
            .upload_monolithic(&RepositoryName::parse("lib/app").unwrap(), &digest, &b"hello"[..])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // an upload of the same digest is being promoted
        let held = metadata.locker().lock(&blob_lock(&digest)).await.unwrap();
        let collector = BlobCollector::new(bucket.clone(), metadata.clone(), Duration::ZERO);
        assert_eq!(collector.collect().await.unwrap(), 0);
        assert!(bucket.exists(&digest.blob_path()).await.unwrap());

        held.release().await.unwrap();
        assert_eq!(collector.collect().await.unwrap(), 1);
        assert!(!bucket.exists(&digest.blob_path()).await.unwrap());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (bucket, metadata) = fixture().await;
        let uploads = UploadManager::new(bucket, metadata);
        let shutdown = CancellationToken::new();
        let handle = UploadSweeper::new(uploads, Duration::from_secs(60), Duration::from_secs(1))
            .spawn(shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
    }
}
