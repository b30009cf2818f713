use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{
    check_part_number, Driver, Metadata, OwnedReader, Reader, StorageError, StorageErrorKind,
    UploadId, Writer,
};

const ENGINE: &str = "memory";

fn not_found(bucket: &str, remote: Option<&Utf8Path>, context: &'static str) -> StorageError {
    let message = match remote {
        Some(remote) => format!("Path not found: {remote}"),
        None => format!("Bucket not found: {bucket}"),
    };
    let builder = StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        std::io::Error::new(std::io::ErrorKind::NotFound, message),
    )
    .bucket(bucket)
    .context(context);

    match remote {
        Some(remote) => builder.path(remote.as_str()).build(),
        None => builder.build(),
    }
}

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

#[derive(Debug)]
struct MemoryUpload {
    bucket: String,
    remote: Utf8PathBuf,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// Storage driver that stores files in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>>,
    uploads: RwLock<HashMap<String, MemoryUpload>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
            uploads: RwLock::default(),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }

    /// Number of multipart uploads which have been started but neither committed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.uploads.read().await.len()
    }

    async fn get(&self, bucket: &str, remote: &Utf8Path) -> Result<MemoryFileItem, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| not_found(bucket, None, "bucket not found"))?;
        bucket_map
            .get(remote)
            .cloned()
            .ok_or_else(|| not_found(bucket, Some(remote), "path not found"))
    }

    fn unknown_upload(upload: &UploadId) -> StorageError {
        StorageError::new(
            ENGINE,
            StorageErrorKind::NotFound,
            format!("no multipart upload with id {upload}"),
        )
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.get(bucket, remote).await.map(|item| (&item).into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found(bucket, None, "bucket not found"))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        buf.shutdown()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        if !overwrite && bucket_map.contains_key(remote) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::AlreadyExists,
                format!("Path already exists: {remote}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let item = self.get(bucket, remote).await?;
        let mut buf: &[u8] = &item.data;

        tokio::io::copy(&mut buf, local)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok(())
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError> {
        let item = self.get(bucket, remote).await?;
        let size = item.data.len() as u64;
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("offset {offset} is past the end of a {size} byte object"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        let mut cursor = Cursor::new(item.data);
        cursor.set_position(offset);
        Ok(Box::pin(cursor))
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found(bucket, None, "bucket not found"))?;
        let item = bucket_map
            .remove(from)
            .ok_or_else(|| not_found(bucket, Some(from), "rename source not found"))?;
        bucket_map.insert(to.to_owned(), item);
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| not_found(bucket, None, "bucket not found"))?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        let id = UploadId::new(uuid::Uuid::new_v4().simple().to_string());
        let mut uploads = self.uploads.write().await;
        uploads.insert(
            id.as_str().to_owned(),
            MemoryUpload {
                bucket: bucket.to_owned(),
                remote: remote.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        tracing::trace!(%bucket, %remote, upload=%id, "started multipart upload");
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<String, StorageError> {
        {
            let uploads = self.uploads.read().await;
            let pending = uploads
                .get(upload.as_str())
                .ok_or_else(|| Self::unknown_upload(upload))?;
            check_part_number(ENGINE, pending.parts.keys().next_back().copied(), part_number)?;
        }

        let mut buf = Vec::new();
        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let etag = crate::part_etag(part_number);
        let mut uploads = self.uploads.write().await;
        let pending = uploads
            .get_mut(upload.as_str())
            .ok_or_else(|| Self::unknown_upload(upload))?;
        check_part_number(ENGINE, pending.parts.keys().next_back().copied(), part_number)?;
        pending
            .parts
            .insert(part_number, (etag.clone(), Bytes::from(buf)));
        Ok(etag)
    }

    async fn commit_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError> {
        let data = {
            let uploads = self.uploads.read().await;
            let pending = uploads
                .get(upload.as_str())
                .ok_or_else(|| Self::unknown_upload(upload))?;

            let by_etag: HashMap<&str, &Bytes> = pending
                .parts
                .values()
                .map(|(etag, data)| (etag.as_str(), data))
                .collect();

            let mut data = Vec::new();
            for etag in etags {
                let part = by_etag.get(etag.as_str()).ok_or_else(|| {
                    StorageError::new(
                        ENGINE,
                        StorageErrorKind::InvalidRequest,
                        format!("unknown etag {etag} for upload {upload}"),
                    )
                })?;
                data.extend_from_slice(part);
            }
            data
        };

        {
            let mut buckets = self.buckets.write().await;
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(remote.to_owned(), data.into());
        }
        self.uploads.write().await.remove(upload.as_str());
        Ok(())
    }

    async fn abort_upload(
        &self,
        _bucket: &str,
        _remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        match self.uploads.write().await.remove(upload.as_str()) {
            Some(pending) => {
                tracing::trace!(bucket=%pending.bucket, remote=%pending.remote, %upload, "aborted multipart upload");
                Ok(())
            }
            None => Err(Self::unknown_upload(upload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_bucket_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .metadata("nope", Utf8Path::new("a"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn reader_past_end_is_rejected() {
        let storage = MemoryStorage::with_buckets(&["b"]);
        let mut data: &[u8] = b"abc";
        storage
            .upload("b", Utf8Path::new("f"), &mut data, false)
            .await
            .unwrap();
        let err = storage.reader("b", Utf8Path::new("f"), 4).await.err().unwrap();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
