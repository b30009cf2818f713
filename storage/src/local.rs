use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{
    check_part_number, Driver, Metadata, OwnedReader, Reader, StorageError, StorageErrorKind,
    UploadId, Writer,
};

const ENGINE: &str = "local";

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live under `<root>/<bucket>/b/`, multipart parts under
/// `<root>/<bucket>/u/<upload id>/<etag>` and in-flight writes under
/// `<root>/<bucket>/t/`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Serve objects from under `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn staging_dir(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("t");
        path
    }

    /// A fresh file under the staging directory. It is removed when the
    /// returned [`TempPath`] drops, unless it was moved into place first.
    async fn staging_file(&self, bucket: &str) -> Result<(tokio::fs::File, TempPath), StorageError> {
        let dir = self.staging_dir(bucket);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        let (file, path) = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|err| StorageError::io(ENGINE, err))?
            .into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }

    fn upload_dir(&self, bucket: &str, upload: &UploadId) -> Result<Utf8PathBuf, StorageError> {
        if upload.as_str().is_empty()
            || !upload
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StorageError::new(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("malformed upload id {upload}"),
            ));
        }
        let mut path = self.root.join(bucket);
        path.push("u");
        path.push(upload.as_str());
        Ok(path)
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?;
        }
        Ok(())
    }

    /// Write a stream to a fresh staging file.
    ///
    /// Dropping the future mid-copy, or the returned path, removes the file.
    async fn stage(&self, bucket: &str, local: &mut Reader<'_>) -> Result<TempPath, StorageError> {
        let (file, staging) = self.staging_file(bucket).await?;
        let mut writer = tokio::io::BufWriter::new(file);
        tokio::io::copy(local, &mut writer)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        writer
            .shutdown()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        Ok(staging)
    }

    /// Part numbers already stored for an upload, by parsing the `<part>-<id>` etags.
    async fn stored_parts(&self, dir: &Utf8Path) -> Result<Vec<(u32, String)>, StorageError> {
        let mut parts = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(number) = name.split('-').next().and_then(|n| n.parse().ok()) {
                parts.push((number, name));
            }
        }
        parts.sort();
        Ok(parts)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let remote = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&remote)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        if !metadata.is_file() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                format!("not a file: {remote}"),
            )
            .path(remote.as_str())
            .build());
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .wrap_err("local driver: file timestamps")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        match tokio::fs::remove_file(remote).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(ENGINE, err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let target = self.path(bucket, remote);
        let staging = self.stage(bucket, local).await?;

        let promoted = async {
            self.create_parent(&target).await?;
            if overwrite {
                tokio::fs::rename(&staging, &target)
                    .await
                    .map_err(|err| StorageError::io(ENGINE, err))?;
                disarm(staging);
            } else {
                // hard_link refuses to replace an existing file; the staging
                // link goes away when `staging` drops
                tokio::fs::hard_link(&staging, &target)
                    .await
                    .map_err(|err| StorageError::io(ENGINE, err))?;
            }
            Ok::<_, StorageError>(())
        }
        .await;

        promoted.map_err(|err| {
            if err.is_already_exists() {
                StorageError::builder(
                    ENGINE,
                    StorageErrorKind::AlreadyExists,
                    format!("Path already exists: {remote}"),
                )
                .bucket(bucket)
                .path(remote.as_str())
                .build()
            } else {
                err
            }
        })
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&remote)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .wrap_err("copy")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        local
            .flush()
            .await
            .wrap_err("flush writer")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        Ok(())
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<OwnedReader, StorageError> {
        let path = self.path(bucket, remote);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let size = file
            .metadata()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?
            .len();
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

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        Ok(Box::pin(file))
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let from = self.path(bucket, from);
        let to = self.path(bucket, to);
        self.create_parent(&to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut root = self.root.join(bucket);
        root.push("b");
        let prefix = prefix.map(|p| p.to_owned());

        let items = tokio::task::spawn_blocking(move || collect_list(&root, prefix.as_deref()))
            .in_current_span()
            .await
            .wrap_err("local driver")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }

    async fn create_upload_id(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadId, StorageError> {
        let upload = UploadId::new(uuid::Uuid::new_v4().simple().to_string());
        let dir = self.upload_dir(bucket, &upload)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        tracing::trace!(%bucket, %remote, %upload, "started multipart upload");
        Ok(upload)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        _remote: &Utf8Path,
        upload: &UploadId,
        part_number: u32,
        reader: &mut Reader<'_>,
    ) -> Result<String, StorageError> {
        let dir = self.upload_dir(bucket, upload)?;
        let stored = self.stored_parts(&dir).await?;
        check_part_number(ENGINE, stored.last().map(|(n, _)| *n), part_number)?;

        let staging = self.stage(bucket, reader).await?;
        let etag = crate::part_etag(part_number);
        tokio::fs::rename(&staging, dir.join(&etag))
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        disarm(staging);

        // A re-sent part replaces the earlier attempt with the same number.
        for (number, name) in stored {
            if number == part_number {
                let _ = tokio::fs::remove_file(dir.join(name)).await;
            }
        }

        Ok(etag)
    }

    async fn commit_upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        upload: &UploadId,
        etags: &[String],
    ) -> Result<(), StorageError> {
        let dir = self.upload_dir(bucket, upload)?;
        if !tokio::fs::try_exists(&dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?
        {
            return Err(StorageError::new(
                ENGINE,
                StorageErrorKind::NotFound,
                format!("no multipart upload with id {upload}"),
            ));
        }

        let (file, staging) = self.staging_file(bucket).await?;
        let mut writer = tokio::io::BufWriter::new(file);

        let assembled = async {
            for etag in etags {
                if etag.contains('/') || etag.contains("..") {
                    return Err(StorageError::new(
                        ENGINE,
                        StorageErrorKind::InvalidRequest,
                        format!("malformed etag {etag}"),
                    ));
                }
                let mut part = tokio::fs::File::open(dir.join(etag)).await.map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        StorageError::new(
                            ENGINE,
                            StorageErrorKind::InvalidRequest,
                            format!("unknown etag {etag} for upload {upload}"),
                        )
                    } else {
                        StorageError::io(ENGINE, err)
                    }
                })?;
                tokio::io::copy(&mut part, &mut writer)
                    .await
                    .map_err(|err| StorageError::io(ENGINE, err))?;
            }
            writer
                .shutdown()
                .await
                .map_err(|err| StorageError::io(ENGINE, err))
        }
        .await;
        assembled?;

        let target = self.path(bucket, remote);
        self.create_parent(&target).await?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        disarm(staging);

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        Ok(())
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        _remote: &Utf8Path,
        upload: &UploadId,
    ) -> Result<(), StorageError> {
        let dir = self.upload_dir(bucket, upload)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))
    }
}

/// Forget a staging file which has been renamed into place.
fn disarm(staging: TempPath) {
    if let Err(error) = staging.keep() {
        tracing::trace!(%error, "staging path already gone");
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path, prefix: Option<&Utf8Path>) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if root.is_dir() {
        visit(root, &mut files)?;
    }

    let mut items: Vec<String> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .filter(|p| prefix.is_none_or(|prefix| p.starts_with(prefix)))
        .map(|p| p.to_string())
        .collect();
    items.sort();
    Ok(items)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
