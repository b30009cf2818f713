use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, OwnedReader, Reader, StorageError, UploadId, Writer};

/// A storage driver that stores files in a temporary directory.
///
/// The directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// The root of the temporary directory.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    fn scheme(&self) -> &str {
        "tmp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local, overwrite).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, local).await
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError> {
        self.driver.reader(bucket, remote, offset).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.rename(bucket, from, to).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        self.driver.create_upload_id(bucket, remote).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<String, StorageError> {
        self.driver
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
        self.driver
            .commit_upload(bucket, remote, upload, etags)
            .await
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        self.driver.abort_upload(bucket, remote, upload).await
    }
}
