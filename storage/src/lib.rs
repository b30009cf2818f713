//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
/// Drivers by URL scheme.
pub mod registry;
/// Retrying transient failures.
pub mod retry;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use registry::DriverRegistry;

#[doc(inline)]
pub use retry::Backoff;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    Driver, Metadata, OwnedReader, StorageError, StorageErrorKind, UploadId,
};

/// Etag for a multipart part: the part number, then a unique suffix.
pub(crate) fn part_etag(part_number: u32) -> String {
    format!("{part_number}-{}", uuid::Uuid::new_v4().simple())
}

/// Which storage driver to use, and how to configure it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory {
        /// The bucket to create up front.
        bucket: String,
    },

    /// Store objects below a local directory.
    #[cfg(feature = "local")]
    Local {
        /// Root directory.
        path: Utf8PathBuf,
    },

    /// Store objects in a temporary directory, removed on shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            bucket: "registry".into(),
        }
    }
}

impl StorageConfig {
    /// The registered driver name this configuration builds.
    pub fn driver(&self) -> &'static str {
        match self {
            StorageConfig::Memory { .. } => "memory",
            #[cfg(feature = "local")]
            StorageConfig::Local { .. } => "local",
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => "temp",
        }
    }

    /// Build the configured driver from the default [`DriverRegistry`].
    #[tracing::instrument]
    pub fn build(&self) -> Result<Storage, StorageError> {
        DriverRegistry::with_defaults().build(self)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
///
/// Idempotent operations are retried on transient failures according to the
/// configured [`Backoff`]; operations which consume a stream are not.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
    backoff: Backoff,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap `driver`, with the default retry policy.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            backoff: Backoff::none(),
        }
    }

    /// Retry transient failures with this backoff policy.
    pub fn with_retry(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The driver's name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle bound to `bucket`.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            storage: self.clone(),
            bucket: bucket.into(),
        }
    }

    /// Size and timestamps of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        retry::retry(&self.backoff, || self.driver.metadata(bucket, remote)).await
    }

    /// Whether an object exists at `remote`.
    pub async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Copy an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        self.driver.download(bucket, remote, writer).await?;
        Ok(())
    }

    /// Open `remote` for reading from `offset`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError> {
        retry::retry(&self.backoff, || self.driver.reader(bucket, remote, offset)).await
    }

    /// Store `reader` at `remote`, refusing to replace it unless `overwrite`.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
        overwrite: bool,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        self.driver.upload(bucket, remote, reader, overwrite).await?;
        Ok(())
    }

    /// Store a local file at `remote`.
    pub async fn upload_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Uploading to: {bucket}/{remote}");
        self.driver.upload_file(bucket, remote, local).await
    }

    /// Copy an object to a local file.
    pub async fn download_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Downloading from: {bucket}/{remote}");
        self.driver.download_file(bucket, remote, local).await
    }

    /// Move an object, replacing anything at the destination.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        retry::retry(&self.backoff, || self.driver.rename(bucket, from, to)).await
    }

    /// Object paths, optionally under `prefix`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        retry::retry(&self.backoff, || self.driver.list(bucket, prefix)).await
    }

    /// Delete an object; deleting a missing object succeeds.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        retry::retry(&self.backoff, || self.driver.delete(bucket, path)).await
    }

    /// Start a multipart upload assembling into `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        retry::retry(&self.backoff, || self.driver.create_upload_id(bucket, remote)).await
    }

    /// Store one part, returning its etag.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload_part<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut R,
    ) -> Result<String, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.driver
            .upload_part(bucket, remote, upload, part_number, reader)
            .await
    }

    /// Assemble the parts named by `etags`, in order, into the object.
    #[tracing::instrument(skip(self, etags), fields(driver=self.driver.name(), parts=etags.len()))]
    pub async fn commit_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError> {
        retry::retry(&self.backoff, || {
            self.driver.commit_upload(bucket, remote, upload, etags)
        })
        .await
    }

    /// Discard a multipart upload and its parts.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn abort_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        retry::retry(&self.backoff, || {
            self.driver.abort_upload(bucket, remote, upload)
        })
        .await
    }
}

/// A [`Storage`] handle bound to a single bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket every call addresses.
    pub bucket: String,
    storage: Storage,
}

impl StorageBucket {
    /// The unbound storage handle.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// See [`Storage::metadata`].
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.storage.metadata(&self.bucket, remote).await
    }

    /// Whether an object exists at `remote`.
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.storage.exists(&self.bucket, remote).await
    }

    /// See [`Storage::download`].
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + 'd,
    {
        self.storage.download(&self.bucket, remote, writer).await
    }

    /// Stream an object from `offset`.
    pub async fn reader(&self, remote: &Utf8Path, offset: u64) -> Result<OwnedReader, StorageError> {
        self.storage.reader(&self.bucket, remote, offset).await
    }

    /// See [`Storage::upload`].
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
        overwrite: bool,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.storage
            .upload(&self.bucket, remote, reader, overwrite)
            .await
    }

    /// See [`Storage::upload_file`].
    pub async fn upload_file(
        &self,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.storage.upload_file(&self.bucket, remote, local).await
    }

    /// See [`Storage::download_file`].
    pub async fn download_file(
        &self,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.storage.download_file(&self.bucket, remote, local).await
    }

    /// Move an object, replacing any object at `to`.
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.storage.rename(&self.bucket, from, to).await
    }

    /// See [`Storage::list`].
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.storage.list(&self.bucket, prefix).await
    }

    /// See [`Storage::delete`].
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.storage.delete(&self.bucket, path).await
    }

    /// See [`Storage::create_upload_id`].
    pub async fn create_upload_id(&self, remote: &Utf8Path) -> Result<UploadId, StorageError> {
        self.storage.create_upload_id(&self.bucket, remote).await
    }

    /// See [`Storage::upload_part`].
    pub async fn upload_part<'d, R>(
        &'d self,
        remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut R,
    ) -> Result<String, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.storage
            .upload_part(&self.bucket, remote, upload, part_number, reader)
            .await
    }

    /// See [`Storage::commit_upload`].
    pub async fn commit_upload(
        &self,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError> {
        self.storage
            .commit_upload(&self.bucket, remote, upload, etags)
            .await
    }

    /// See [`Storage::abort_upload`].
    pub async fn abort_upload(
        &self,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        self.storage
            .abort_upload(&self.bucket, remote, upload)
            .await
    }
}
