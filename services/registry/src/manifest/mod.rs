//! Manifest ingest: turning pushed manifests into artifacts, tags and referrer edges.

use bytes::Bytes;
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::config::NamespaceConfig;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::models::{ArtifactRow, NewArtifact, NewNamespace, NewRepository, RepositoryRow, Visibility};
use crate::metadata::{LockGuard, MetadataError, MetadataStore};
use crate::reference::{Reference, RepositoryName};
use crate::work::{ARTIFACT_PUSHED, ArtifactPushed, Producer};

mod document;

pub use document::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, Descriptor, HELM_CONFIG, Manifest, ManifestKind,
    OCI_ARTIFACT_MANIFEST, OCI_IMAGE_INDEX, OCI_IMAGE_MANIFEST,
};

/// Outcome of a manifest push.
#[derive(Debug, Clone)]
pub struct PushedManifest {
    /// Digest of the stored manifest.
    pub digest: Digest,
    /// The manifest's subject, echoed as `OCI-Subject`.
    pub subject: Option<Digest>,
    /// False when the same bytes were already stored in this repository.
    pub created: bool,
}

/// A stored manifest, ready to serve.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    /// Digest of the manifest bytes.
    pub digest: Digest,
    /// The content type to serve.
    pub media_type: String,
    /// The manifest exactly as pushed.
    pub raw: Bytes,
}

/// The referrers response: an image index of referring manifests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Always the OCI image index type.
    pub media_type: &'static str,
    /// One descriptor per referring manifest.
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_IMAGE_INDEX,
            manifests,
        }
    }
}

/// Manifest operations over the metadata store.
#[derive(Debug, Clone)]
pub struct ManifestService {
    metadata: MetadataStore,
    work: Producer,
    namespaces: NamespaceConfig,
    max_bytes: usize,
}

impl ManifestService {
    /// Manifests are capped at `max_bytes`; `namespaces` governs first-push provisioning.
    pub fn new(metadata: MetadataStore, namespaces: NamespaceConfig, max_bytes: usize) -> Self {
        Self {
            work: Producer::new(metadata.clone()),
            metadata,
            namespaces,
            max_bytes,
        }
    }

    /// Store a manifest under `reference`.
    ///
    /// Every descriptor must already be present: blobs in the blob table and
    /// child manifests in the same repository. The artifact, its links, the
    /// tag binding and the quota counters commit together.
    #[tracing::instrument(skip(self, repository, content_type, body), fields(%repository, size = body.len()))]
    pub async fn put(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
        content_type: Option<&str>,
        body: Bytes,
    ) -> RegistryResult<PushedManifest> {
        if body.len() > self.max_bytes {
            return Err(RegistryError::ManifestTooLarge {
                limit: self.max_bytes,
            });
        }

        let digest = Digest::sha256(&body);
        if let Reference::Digest(expected) = reference {
            if *expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let manifest = Manifest::parse(content_type, &body)?;
        tracing::trace!(kind = ?manifest.kind, media_type = %manifest.media_type, "manifest parsed");

        let guard = self
            .metadata
            .retry(|| self.lock_tag(repository, reference))
            .await?;
        let result = self
            .metadata
            .retry(|| self.ingest(repository, reference, &digest, &manifest, &body))
            .await;
        release(guard).await;
        let (artifact, created) = result?;

        if created {
            let task = ArtifactPushed {
                repository: repository.to_string(),
                digest: artifact.digest.clone(),
                media_type: artifact.media_type.clone(),
            };
            if let Err(error) = self.work.enqueue(ARTIFACT_PUSHED, &task).await {
                tracing::warn!(%error, "failed to enqueue pushed artifact");
            }
            tracing::info!(%digest, "manifest pushed");
        }

        Ok(PushedManifest {
            digest,
            subject: manifest.subject.map(|s| s.digest),
            created,
        })
    }

    async fn ingest(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
        digest: &Digest,
        manifest: &Manifest,
        body: &[u8],
    ) -> RegistryResult<(ArtifactRow, bool)> {
        let mut tx = self.metadata.transaction().await?;
        let repo = self.ensure_repository(&mut tx, repository).await?;

        let blob_digests = manifest.blob_digests();
        let blobs = self
            .metadata
            .blobs()
            .find_by_digests(&mut tx, &blob_digests)
            .await?;
        if let Some(missing) = first_missing(&blob_digests, blobs.iter().map(|b| b.digest.as_str())) {
            return Err(RegistryError::ManifestBlobUnknown(missing.to_owned()));
        }

        let child_digests = manifest.manifest_digests();
        let children = self
            .metadata
            .artifacts()
            .get_by_digests(&mut tx, repo.id, &child_digests)
            .await?;
        if let Some(missing) =
            first_missing(&child_digests, children.iter().map(|a| a.digest.as_str()))
        {
            return Err(RegistryError::ManifestBlobUnknown(missing.to_owned()));
        }

        let size = body.len() as i64 + blobs.iter().map(|b| b.size).sum::<i64>();
        let artifact = NewArtifact {
            repository_id: repo.id,
            digest: digest.to_string(),
            media_type: manifest.media_type.clone(),
            artifact_type: manifest.artifact_type.clone(),
            config_media_type: manifest.config.as_ref().map(|c| c.media_type.clone()),
            subject_digest: manifest.subject.as_ref().map(|s| s.digest.to_string()),
            raw: body.to_vec(),
            size,
        };

        let (row, created) = self.metadata.artifacts().save(&mut tx, &artifact).await?;
        if created {
            let blob_ids: Vec<i64> = blobs.iter().map(|b| b.id).collect();
            let child_ids: Vec<i64> = children.iter().map(|a| a.id).collect();
            let artifacts = self.metadata.artifacts();
            artifacts.associate_blobs(&mut tx, row.id, &blob_ids).await?;
            artifacts
                .associate_artifacts(&mut tx, row.id, &child_ids)
                .await?;
            self.metadata
                .repositories()
                .add_size(&mut tx, repo.id, row.size)
                .await?;
        }

        if let Some(tag) = reference.tag() {
            self.metadata
                .tags()
                .save(&mut tx, repo.id, row.id, tag)
                .await?;
        }

        tx.commit().await.map_err(MetadataError::from)?;
        Ok((row, created))
    }

    /// Find the repository, creating it (and its namespace) on first push.
    ///
    /// A concurrent first push may create either row between the lookup and
    /// the insert; the insert then reports a duplicate and the row it lost
    /// to is used instead.
    async fn ensure_repository(
        &self,
        conn: &mut SqliteConnection,
        repository: &RepositoryName,
    ) -> RegistryResult<RepositoryRow> {
        let repositories = self.metadata.repositories();
        if let Some(row) = repositories.get_by_name(conn, repository.as_str()).await? {
            return Ok(row);
        }
        if !self.namespaces.auto_create {
            return Err(RegistryError::NameUnknown(repository.to_string()));
        }

        let namespaces = self.metadata.namespaces();
        let namespace = match namespaces.get_by_name(conn, repository.namespace()).await? {
            Some(namespace) => namespace,
            None => {
                let created = namespaces
                    .create(
                        conn,
                        &NewNamespace {
                            name: repository.namespace().to_owned(),
                            description: None,
                            visibility: Visibility::Private,
                            limits: self.namespaces.limits,
                        },
                    )
                    .await;
                match created {
                    Ok(namespace) => namespace,
                    Err(MetadataError::AlreadyExists(_)) => namespaces
                        .get_by_name(conn, repository.namespace())
                        .await?
                        .ok_or_else(|| RegistryError::NameUnknown(repository.to_string()))?,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let created = repositories
            .create(
                conn,
                &NewRepository {
                    namespace_id: namespace.id,
                    name: repository.to_string(),
                    description: None,
                    visibility: Visibility::Private,
                },
            )
            .await;
        match created {
            Ok(row) => Ok(row),
            Err(MetadataError::AlreadyExists(_)) => {
                tracing::debug!("repository created concurrently");
                repositories
                    .get_by_name(conn, repository.as_str())
                    .await?
                    .ok_or_else(|| RegistryError::NameUnknown(repository.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn lock_tag(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<Option<LockGuard>> {
        let Some(tag) = reference.tag() else {
            return Ok(None);
        };
        let guard = self
            .metadata
            .locker()
            .lock(&format!("tag:{repository}:{tag}"))
            .await?;
        Ok(Some(guard))
    }

    /// Resolve `reference` to its stored manifest.
    ///
    /// With `count_pull`, the artifact (and tag) pull counters are bumped in
    /// the background; failures there never fail the read.
    #[tracing::instrument(skip(self, repository), fields(%repository))]
    pub async fn get(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
        count_pull: bool,
    ) -> RegistryResult<StoredManifest> {
        let (artifact, tag_id) = {
            let mut conn = self.metadata.connection().await?;
            let repo = self
                .metadata
                .repositories()
                .get_by_name(&mut conn, repository.as_str())
                .await?
                .ok_or_else(|| RegistryError::NameUnknown(repository.to_string()))?;

            match reference {
                Reference::Digest(digest) => {
                    let artifact = self
                        .metadata
                        .artifacts()
                        .get_by_digest(&mut conn, repo.id, &digest.to_string())
                        .await?
                        .ok_or_else(|| RegistryError::ManifestUnknown(digest.to_string()))?;
                    (artifact, None)
                }
                Reference::Tag(tag) => {
                    let tag = self
                        .metadata
                        .tags()
                        .get_by_name(&mut conn, repo.id, tag)
                        .await?
                        .ok_or_else(|| RegistryError::ManifestUnknown(tag.clone()))?;
                    let artifact = self
                        .metadata
                        .artifacts()
                        .get_by_id(&mut conn, tag.artifact_id)
                        .await?;
                    (artifact, Some(tag.id))
                }
            }
        };

        if count_pull {
            self.record_pull(artifact.id, tag_id);
        }

        Ok(StoredManifest {
            digest: artifact.digest.parse()?,
            media_type: artifact.media_type,
            raw: Bytes::from(artifact.raw),
        })
    }

    fn record_pull(&self, artifact_id: i64, tag_id: Option<i64>) {
        let metadata = self.metadata.clone();
        tokio::spawn(async move {
            let result = async {
                let mut conn = metadata.connection().await?;
                metadata.artifacts().incr_pull(&mut conn, artifact_id).await?;
                if let Some(tag_id) = tag_id {
                    metadata.tags().incr_pull(&mut conn, tag_id).await?;
                }
                Ok::<_, MetadataError>(())
            }
            .await;
            if let Err(error) = result {
                tracing::warn!(%error, artifact_id, "failed to record manifest pull");
            }
        });
    }

    /// Delete by digest (the artifact and every tag on it) or by tag (the binding only).
    #[tracing::instrument(skip(self, repository), fields(%repository))]
    pub async fn delete(
        &self,
        repository: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<()> {
        let guard = self
            .metadata
            .retry(|| self.lock_tag(repository, reference))
            .await?;
        let result = self
            .metadata
            .retry(|| self.remove(repository, reference))
            .await;
        release(guard).await;
        result?;
        tracing::info!(%reference, "manifest deleted");
        Ok(())
    }

    async fn remove(&self, repository: &RepositoryName, reference: &Reference) -> RegistryResult<()> {
        let mut tx = self.metadata.transaction().await?;
        let repo = self
            .metadata
            .repositories()
            .get_by_name(&mut tx, repository.as_str())
            .await?
            .ok_or_else(|| RegistryError::NameUnknown(repository.to_string()))?;

        match reference {
            Reference::Digest(digest) => {
                let artifact = self
                    .metadata
                    .artifacts()
                    .get_by_digest(&mut tx, repo.id, &digest.to_string())
                    .await?
                    .ok_or_else(|| RegistryError::ManifestUnknown(digest.to_string()))?;
                self.metadata.artifacts().delete(&mut tx, artifact.id).await?;
            }
            Reference::Tag(tag) => {
                self.metadata
                    .tags()
                    .delete_by_name(&mut tx, repo.id, tag)
                    .await
                    .map_err(|err| match err {
                        MetadataError::NotFound(_) => RegistryError::ManifestUnknown(tag.clone()),
                        other => other.into(),
                    })?;
            }
        }

        tx.commit().await.map_err(MetadataError::from)?;
        Ok(())
    }

    /// Manifests in `repository` whose subject is `subject`, optionally
    /// restricted to `artifact_types`.
    ///
    /// Unknown repositories and subjects give an empty index.
    #[tracing::instrument(skip(self, repository), fields(%repository))]
    pub async fn referrers(
        &self,
        repository: &RepositoryName,
        subject: &Digest,
        artifact_types: &[String],
    ) -> RegistryResult<ImageIndex> {
        let mut conn = self.metadata.connection().await?;
        let Some(repo) = self
            .metadata
            .repositories()
            .get_by_name(&mut conn, repository.as_str())
            .await?
        else {
            return Ok(ImageIndex::new(Vec::new()));
        };

        let rows = self
            .metadata
            .artifacts()
            .referrers(&mut conn, repo.id, &subject.to_string(), artifact_types)
            .await?;

        let manifests = rows
            .into_iter()
            .map(|row| {
                Ok(Descriptor {
                    digest: row.digest.parse()?,
                    size: row.raw.len() as i64,
                    annotations: document::annotations(&row.raw),
                    artifact_type: row.artifact_type,
                    media_type: row.media_type,
                })
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        Ok(ImageIndex::new(manifests))
    }
}

async fn release(guard: Option<LockGuard>) {
    if let Some(guard) = guard {
        let name = guard.name().to_owned();
        if let Err(error) = guard.release().await {
            tracing::warn!(%error, %name, "failed to release lock");
        }
    }
}

fn first_missing<'a>(
    wanted: &'a [String],
    found: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let found: Vec<&str> = found.collect();
    wanted
        .iter()
        .map(String::as_str)
        .find(|digest| !found.contains(digest))
}
