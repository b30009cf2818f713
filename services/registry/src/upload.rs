//! Blob upload sessions.
//!
//! A session is a backend multipart upload written to a staging object
//! (`uploads/<id>/data`) plus its `blob_uploads` rows. Each PATCH becomes one
//! part. Finishing commits the parts to the staging object, checks the digest,
//! then moves the object to its content-addressed path.
//!
//! The running SHA-256 of each session is cached in process. A session whose
//! hash state was lost (for instance across a restart) is re-hashed from the
//! committed staging object instead.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use dashmap::DashMap;
use pin_project::pin_project;
use sha2::{Digest as _, Sha256};
use sqlx::SqliteConnection;
use storage::{StorageBucket, UploadId};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{MetadataError, MetadataStore};
use crate::metadata::models::{BlobRow, BlobUploadRow, NewBlobUploadPart};
use crate::reference::RepositoryName;

/// Content type recorded for blobs; the registry does not interpret them.
pub(crate) const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

/// Most stale sessions examined by one sweep.
const SWEEP_BATCH: u32 = 100;

/// The named lock serialising promotion and collection of one blob.
pub(crate) fn blob_lock(digest: &Digest) -> String {
    format!("blob:{digest}")
}

/// Where a session's bytes are assembled before promotion.
fn staging(upload_id: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("uploads/{upload_id}/data"))
}

/// Hashes and counts every byte read through it.
#[pin_project]
pub(crate) struct HashingReader<R> {
    #[pin]
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R> HashingReader<R> {
    pub(crate) fn new(inner: R, hasher: Sha256) -> Self {
        Self {
            inner,
            hasher,
            count: 0,
        }
    }

    /// The hash state and byte count so far.
    pub(crate) fn finish(self) -> (Sha256, u64) {
        (self.hasher, self.count)
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let read = &buf.filled()[before..];
        this.hasher.update(read);
        *this.count += read.len() as u64;
        Poll::Ready(Ok(()))
    }
}

/// The progress of an upload session, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    /// The session id used in upload URLs.
    pub id: String,
    /// The repository the session belongs to.
    pub repository: String,
    /// Bytes received so far.
    pub size: u64,
}

impl UploadStatus {
    /// `/v2/<name>/blobs/uploads/<id>`
    pub fn location(&self) -> String {
        format!("/v2/{}/blobs/uploads/{}", self.repository, self.id)
    }

    /// Inclusive byte range received so far; `0-0` when empty.
    pub fn range(&self) -> String {
        format!("0-{}", self.size.saturating_sub(1))
    }
}

/// An inclusive `Content-Range` on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
}

impl ChunkRange {
    /// Parse `<start>-<end>`, with or without a `bytes ` prefix.
    pub fn parse(value: &str) -> RegistryResult<Self> {
        let invalid = || RegistryError::RangeNotSatisfiable(format!("malformed range {value}"));
        let value = value.trim();
        let value = value.strip_prefix("bytes ").unwrap_or(value);
        let value = value.split('/').next().unwrap_or(value);
        let (start, end) = value.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Default)]
struct SessionState {
    /// `None` once the hash no longer covers every recorded part.
    hasher: Option<Sha256>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("hashing", &self.hasher.is_some())
            .finish()
    }
}

/// Drives blob upload sessions against storage and the metadata store.
#[derive(Debug, Clone)]
pub struct UploadManager {
    blobs: StorageBucket,
    metadata: MetadataStore,
    sessions: Arc<DashMap<String, Arc<Mutex<SessionState>>>>,
    max_chunk: Option<u64>,
}

impl UploadManager {
    /// Sessions stage data in `blobs` and are recorded in `metadata`.
    pub fn new(blobs: StorageBucket, metadata: MetadataStore) -> Self {
        Self {
            blobs,
            metadata,
            sessions: Arc::new(DashMap::new()),
            max_chunk: None,
        }
    }

    /// Refuse PATCH bodies larger than `bytes`.
    pub fn with_max_chunk(mut self, bytes: Option<u64>) -> Self {
        self.max_chunk = bytes;
        self
    }

    /// Number of sessions with in-process state.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Open a new session.
    #[tracing::instrument(skip_all, fields(%repository))]
    pub async fn initiate(&self, repository: &RepositoryName) -> RegistryResult<UploadStatus> {
        let id = uuid::Uuid::new_v4().to_string();
        let staging = staging(&id);
        let backend = self.blobs.create_upload_id(&staging).await?;

        let anchor = NewBlobUploadPart {
            upload_id: id.clone(),
            part_number: 0,
            repository: repository.to_string(),
            file_id: backend.to_string(),
            etag: String::new(),
            size: 0,
        };
        let created = self
            .metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                self.metadata.uploads().create(&mut conn, &anchor).await
            })
            .await;
        if let Err(err) = created {
            if let Err(error) = self.blobs.abort_upload(&staging, &backend).await {
                tracing::warn!(%error, "failed to abort orphaned multipart upload");
            }
            return Err(err.into());
        }

        self.sessions.insert(
            id.clone(),
            Arc::new(Mutex::new(SessionState {
                hasher: Some(Sha256::new()),
            })),
        );
        tracing::debug!(upload = %id, "upload initiated");
        Ok(UploadStatus {
            id,
            repository: repository.to_string(),
            size: 0,
        })
    }

    /// Report how much of a session has been received.
    pub async fn status(
        &self,
        repository: &RepositoryName,
        id: &str,
    ) -> RegistryResult<UploadStatus> {
        let mut conn = self.metadata.connection().await?;
        self.anchor(&mut conn, repository, id).await?;
        let size = self.metadata.uploads().total_size(&mut conn, id).await?;
        Ok(UploadStatus {
            id: id.to_owned(),
            repository: repository.to_string(),
            size: u64::try_from(size).unwrap_or_default(),
        })
    }

    /// Append one chunk.
    ///
    /// With a `range`, the chunk must start where the session ends and be
    /// exactly as long as the range says.
    #[tracing::instrument(skip(self, repository, body), fields(%repository))]
    pub async fn append<R>(
        &self,
        repository: &RepositoryName,
        id: &str,
        range: Option<ChunkRange>,
        body: R,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (mut state, anchor) = self.lock(repository, id).await?;
        self.write_chunk(&mut state, &anchor, range, body).await
    }

    /// Append an optional final chunk, verify the digest and commit the blob.
    ///
    /// On a digest mismatch the session is left in place so it can be aborted.
    #[tracing::instrument(skip(self, repository, digest, body), fields(%repository, %digest))]
    pub async fn finish<R>(
        &self,
        repository: &RepositoryName,
        id: &str,
        digest: &Digest,
        body: Option<R>,
    ) -> RegistryResult<BlobRow>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (mut state, anchor) = self.lock(repository, id).await?;
        if let Some(body) = body {
            self.write_chunk(&mut state, &anchor, None, body).await?;
        }

        let (etags, size) = self
            .metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                let uploads = self.metadata.uploads();
                let etags = uploads.total_etags(&mut conn, id).await?;
                let size = uploads.total_size(&mut conn, id).await?;
                Ok::<_, MetadataError>((etags, size))
            })
            .await?;

        if let Some(hasher) = &state.hasher {
            verify(digest, Digest::from_hasher(hasher.clone()))?;
        }

        let staging = staging(id);
        let backend = UploadId::from(anchor.file_id.clone());
        self.blobs.commit_upload(&staging, &backend, &etags).await?;

        if state.hasher.is_none() {
            tracing::debug!("re-hashing upload without cached state");
            let actual = self.hash_object(&staging).await?;
            if let Err(err) = verify(digest, actual) {
                if let Err(error) = self.blobs.delete(&staging).await {
                    tracing::warn!(%error, "failed to remove mismatched staging object");
                }
                return Err(err);
            }
        }

        let blob = self
            .promote(&staging, digest, u64::try_from(size).unwrap_or_default())
            .await?;

        self.forget(id).await?;
        self.sessions.remove(id);
        tracing::info!(size = blob.size, "blob committed");
        Ok(blob)
    }

    /// Store a whole blob in one request, without a session.
    #[tracing::instrument(skip_all, fields(%repository, %digest))]
    pub async fn upload_monolithic<R>(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
        body: R,
    ) -> RegistryResult<BlobRow>
    where
        R: AsyncRead + Unpin + Send,
    {
        let staging = staging(&uuid::Uuid::new_v4().to_string());
        let mut reader = BufReader::new(HashingReader::new(body, Sha256::new()));
        self.blobs.upload(&staging, &mut reader, true).await?;
        let (hasher, size) = reader.into_inner().finish();

        if let Err(err) = verify(digest, Digest::from_hasher(hasher)) {
            if let Err(error) = self.blobs.delete(&staging).await {
                tracing::warn!(%error, "failed to remove mismatched staging object");
            }
            return Err(err);
        }
        self.promote(&staging, digest, size).await
    }

    /// Abort a session and discard everything it received.
    #[tracing::instrument(skip(self, repository), fields(%repository))]
    pub async fn abort(&self, repository: &RepositoryName, id: &str) -> RegistryResult<()> {
        let (_state, anchor) = self.lock(repository, id).await?;
        self.discard(&anchor).await?;
        self.sessions.remove(id);
        tracing::debug!(upload = %id, "upload aborted");
        Ok(())
    }

    /// The blob with `digest`, if it can be mounted without copying.
    pub async fn mount(&self, digest: &Digest) -> RegistryResult<Option<BlobRow>> {
        let blob = {
            let mut conn = self.metadata.connection().await?;
            self.metadata
                .blobs()
                .find_by_digest(&mut conn, &digest.to_string())
                .await?
        };
        match blob {
            Some(blob) if self.blobs.exists(&digest.blob_path()).await? => Ok(Some(blob)),
            _ => Ok(None),
        }
    }

    /// Abort sessions with no activity for `idle`; busy sessions are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, idle: Duration) -> RegistryResult<usize> {
        let Some(before) = chrono::Duration::from_std(idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return Ok(0);
        };

        let stale = {
            let mut conn = self.metadata.connection().await?;
            self.metadata
                .uploads()
                .list_stale(&mut conn, before, SWEEP_BATCH)
                .await?
        };

        let mut swept = 0;
        for anchor in stale {
            let (session, created) = self.session(&anchor.upload_id);
            let Ok(_state) = session.try_lock_owned() else {
                continue;
            };
            if let Err(error) = self.discard(&anchor).await {
                tracing::warn!(upload = %anchor.upload_id, %error, "failed to sweep session");
                if created {
                    self.sessions.remove(&anchor.upload_id);
                }
                continue;
            }
            self.sessions.remove(&anchor.upload_id);
            tracing::info!(upload = %anchor.upload_id, repository = %anchor.repository, "session swept");
            swept += 1;
        }
        Ok(swept)
    }

    /// The in-process state of a session, and whether this call created it.
    fn session(&self, id: &str) -> (Arc<Mutex<SessionState>>, bool) {
        let mut created = false;
        let state = self
            .sessions
            .entry(id.to_owned())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SessionState::default()))
            })
            .value()
            .clone();
        (state, created)
    }

    /// Claim a session for the duration of one request.
    ///
    /// State created for an id which turns out not to be a usable session is
    /// dropped again, so unknown ids leave nothing behind.
    async fn lock(
        &self,
        repository: &RepositoryName,
        id: &str,
    ) -> RegistryResult<(OwnedMutexGuard<SessionState>, BlobUploadRow)> {
        let (session, created) = self.session(id);
        let state = session
            .try_lock_owned()
            .map_err(|_| RegistryError::Conflict(format!("upload {id} is busy")))?;

        let anchor = self
            .metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                self.metadata.uploads().get_anchor(&mut conn, id).await
            })
            .await;

        let err = match anchor {
            Ok(anchor) if anchor.repository == repository.as_str() => return Ok((state, anchor)),
            Ok(_) => RegistryError::BlobUploadUnknown(id.to_owned()),
            Err(err) if err.is_not_found() => {
                self.sessions.remove(id);
                return Err(RegistryError::BlobUploadUnknown(id.to_owned()));
            }
            Err(err) => err.into(),
        };
        if created {
            self.sessions.remove(id);
        }
        Err(err)
    }

    async fn anchor(
        &self,
        conn: &mut SqliteConnection,
        repository: &RepositoryName,
        id: &str,
    ) -> RegistryResult<BlobUploadRow> {
        match self.metadata.uploads().get_anchor(conn, id).await {
            Ok(anchor) if anchor.repository == repository.as_str() => Ok(anchor),
            Ok(_) => Err(RegistryError::BlobUploadUnknown(id.to_owned())),
            Err(err) if err.is_not_found() => Err(RegistryError::BlobUploadUnknown(id.to_owned())),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_chunk<R>(
        &self,
        state: &mut SessionState,
        anchor: &BlobUploadRow,
        range: Option<ChunkRange>,
        body: R,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = anchor.upload_id.as_str();
        let (last, size) = {
            let mut conn = self.metadata.connection().await?;
            let uploads = self.metadata.uploads();
            (
                uploads.get_last_part(&mut conn, id).await?,
                uploads.total_size(&mut conn, id).await?,
            )
        };
        let size = u64::try_from(size).unwrap_or_default();
        let status = |size| UploadStatus {
            id: id.to_owned(),
            repository: anchor.repository.clone(),
            size,
        };

        if let Some(range) = range {
            if range.start != size {
                return Err(RegistryError::RangeNotSatisfiable(format!(
                    "chunk starts at {}, upload has {size} bytes",
                    range.start
                )));
            }
        }
        if size == 0 && state.hasher.is_none() {
            state.hasher = Some(Sha256::new());
        }

        let part_number = u32::try_from(last.part_number + 1)
            .map_err(|_| RegistryError::BlobUploadInvalid(format!("upload {id} has too many parts")))?;
        let limit = self.max_chunk.map_or(u64::MAX, |max| max.saturating_add(1));
        let hasher = state.hasher.clone().unwrap_or_default();
        let mut reader = BufReader::new(HashingReader::new(body.take(limit), hasher));

        let backend = UploadId::from(anchor.file_id.clone());
        let etag = self
            .blobs
            .upload_part(&staging(id), &backend, part_number, &mut reader)
            .await?;
        let (hasher, written) = reader.into_inner().finish();

        if let Some(max) = self.max_chunk {
            if written > max {
                return Err(RegistryError::SizeInvalid(format!(
                    "chunk exceeds {max} bytes"
                )));
            }
        }
        if let Some(range) = range {
            if written != range.len() {
                return Err(RegistryError::RangeNotSatisfiable(format!(
                    "range covers {} bytes, body had {written}",
                    range.len()
                )));
            }
        }
        if written == 0 {
            return Ok(status(size));
        }

        let part = NewBlobUploadPart {
            upload_id: id.to_owned(),
            part_number: i64::from(part_number),
            repository: anchor.repository.clone(),
            file_id: anchor.file_id.clone(),
            etag,
            size: i64::try_from(written).unwrap_or(i64::MAX),
        };
        self.metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                self.metadata.uploads().create(&mut conn, &part).await
            })
            .await?;

        if state.hasher.is_some() {
            state.hasher = Some(hasher);
        }
        tracing::trace!(upload = %id, part_number, written, "chunk recorded");
        Ok(status(size + written))
    }

    async fn discard(&self, anchor: &BlobUploadRow) -> RegistryResult<()> {
        let staging = staging(&anchor.upload_id);
        match self
            .blobs
            .abort_upload(&staging, &UploadId::from(anchor.file_id.clone()))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        self.blobs.delete(&staging).await?;
        self.forget(&anchor.upload_id).await
    }

    /// Drop every `blob_uploads` row of a session.
    async fn forget(&self, id: &str) -> RegistryResult<()> {
        self.metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                self.metadata.uploads().delete_by_upload_id(&mut conn, id).await
            })
            .await?;
        Ok(())
    }

    /// Move a verified staging object to its blob path and record the blob.
    ///
    /// Runs under the blob's named lock, so the collector never deletes an
    /// object between the existence check here and the row refresh.
    async fn promote(
        &self,
        staging: &Utf8Path,
        digest: &Digest,
        size: u64,
    ) -> RegistryResult<BlobRow> {
        let name = blob_lock(digest);
        let guard = self
            .metadata
            .retry(|| async { self.metadata.locker().lock(&name).await })
            .await?;
        let result = self.place(staging, digest, size).await;
        if let Err(error) = guard.release().await {
            tracing::warn!(%error, %name, "failed to release lock");
        }
        result
    }

    async fn place(&self, staging: &Utf8Path, digest: &Digest, size: u64) -> RegistryResult<BlobRow> {
        let target = digest.blob_path();
        if self.blobs.exists(&target).await? {
            self.blobs.delete(staging).await?;
        } else {
            self.blobs.rename(staging, &target).await?;
        }

        let digest = digest.to_string();
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        Ok(self
            .metadata
            .retry(|| async {
                let mut conn = self.metadata.connection().await?;
                self.metadata
                    .blobs()
                    .create(&mut conn, &digest, size, BLOB_CONTENT_TYPE)
                    .await
            })
            .await?)
    }

    async fn hash_object(&self, path: &Utf8Path) -> RegistryResult<Digest> {
        let reader = self.blobs.reader(path, 0).await?;
        let mut hashing = HashingReader::new(reader, Sha256::new());
        tokio::io::copy(&mut hashing, &mut tokio::io::sink()).await?;
        Ok(Digest::from_hasher(hashing.finish().0))
    }
}

fn verify(expected: &Digest, actual: Digest) -> RegistryResult<()> {
    if expected == &actual {
        return Ok(());
    }
    Err(RegistryError::DigestMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}
