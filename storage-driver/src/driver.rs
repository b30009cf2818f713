#![allow(clippy::needless_pass_by_ref_mut)]

use std::{fmt, ops::Deref, pin::Pin, sync::Arc};

use eyre::WrapErr;
use tokio::io::{self, AsyncWriteExt};

use crate::error::{StorageError, StorageErrorKind};
use camino::Utf8Path;
use chrono::{DateTime, Utc};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + 'w;

/// An owned reader, positioned at the requested offset, which can outlive the
/// driver call that produced it (e.g. to stream a response body).
pub type OwnedReader = Pin<Box<dyn io::AsyncRead + Send + 'static>>;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// Opaque identifier of a multipart upload session inside a driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId(String);

impl UploadId {
    /// Wrap a driver-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UploadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Check that part numbers in a multipart session are 1-based and that a new
/// part does not go backwards.
///
/// `previous` is the highest part number already stored for the session. Re-sending
/// the most recent part replaces it, anything lower is rejected.
pub fn check_part_number(
    engine: &'static str,
    previous: Option<u32>,
    part_number: u32,
) -> Result<(), StorageError> {
    if part_number == 0 {
        return Err(StorageError::new(
            engine,
            StorageErrorKind::InvalidRequest,
            "part numbers start at 1",
        ));
    }

    match previous {
        Some(previous) if part_number < previous => Err(StorageError::new(
            engine,
            StorageErrorKind::InvalidRequest,
            format!("part {part_number} is out of order, last part was {previous}"),
        )),
        _ => Ok(()),
    }
}

/// A storage driver, which provides the ability to interact with a storage backend.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme of the driver.
    fn scheme(&self) -> &str;

    /// Delete a file from the storage, by path.
    ///
    /// Deleting a path which does not exist is not an error.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for a file, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload a file to the storage, using a reader stream to provide the contents.
    ///
    /// The write is atomic: readers observe either the previous object or the complete
    /// new one. When `overwrite` is false and the path already exists, this fails with
    /// [`StorageErrorKind::AlreadyExists`].
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        overwrite: bool,
    ) -> Result<(), StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Open a file for reading, starting `offset` bytes into the file.
    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError>;

    /// Atomically move a file to a new path, replacing any file at the destination.
    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError>;

    /// List the files in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Start a multipart upload which will eventually be assembled at `remote`.
    async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError>;

    /// Upload a single part of a multipart upload, returning its etag.
    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<String, StorageError>;

    /// Assemble the parts named by `etags`, in order, into the file at `remote`.
    async fn commit_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError>;

    /// Discard every part of a multipart upload.
    async fn abort_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError>;

    /// Download a file from storage, into a local file.
    async fn download_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Downloading to file: {local}");

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err("create parents of local destination file")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        }
        let mut file = tokio::io::BufWriter::new(
            tokio::fs::File::create(local)
                .await
                .wrap_err("create local file for writing")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?,
        );
        self.download(bucket, remote, &mut file).await?;
        file.shutdown()
            .await
            .wrap_err("shutdown file buffer")
            .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        Ok(())
    }

    /// Upload a file to storage, from a local file.
    async fn upload_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Uploading from file: {local}");
        let mut file = tokio::io::BufReader::new(
            tokio::fs::File::open(local)
                .await
                .wrap_err("open local file for reading")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?,
        );

        self.upload(bucket, remote, &mut file, true).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader, overwrite).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError> {
        self.deref().reader(bucket, remote, offset).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().rename(bucket, from, to).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.deref().create_upload_id(bucket, remote).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<String, StorageError> {
        self.deref()
            .upload_part(bucket, remote, upload, part_number, reader)
            .await
    }

    async fn commit_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError> {
        self.deref()
            .commit_upload(bucket, remote, upload, etags)
            .await
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        self.deref().abort_upload(bucket, remote, upload).await
    }
}
