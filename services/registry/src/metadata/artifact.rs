use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::models::{
    ArtifactRow, ArtifactSbomRow, ArtifactVulnerabilityRow, NewArtifact, Pagination, ScanRecord,
};
use super::repository::Repositories;
use super::{MetadataError, MetadataResult};

/// Manifests stored per repository, with their blob and child links.
#[derive(Debug, Clone, Copy)]
pub struct Artifacts;

impl Artifacts {
    /// Insert an artifact unless `(repository, digest)` already exists.
    ///
    /// Returns the stored row and whether this call created it.
    #[tracing::instrument(skip(self, conn, artifact), fields(digest = %artifact.digest))]
    pub async fn save(
        &self,
        conn: &mut SqliteConnection,
        artifact: &NewArtifact,
    ) -> MetadataResult<(ArtifactRow, bool)> {
        let inserted = sqlx::query_as::<_, ArtifactRow>(
            r#"
            INSERT INTO artifacts (
                repository_id, digest, media_type, artifact_type, config_media_type,
                subject_digest, raw, size, pushed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (repository_id, digest) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(artifact.repository_id)
        .bind(&artifact.digest)
        .bind(&artifact.media_type)
        .bind(&artifact.artifact_type)
        .bind(&artifact.config_media_type)
        .bind(&artifact.subject_digest)
        .bind(&artifact.raw)
        .bind(artifact.size)
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await?;

        match inserted {
            Some(row) => Ok((row, true)),
            None => {
                let row = self
                    .get_by_digest(conn, artifact.repository_id, &artifact.digest)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("artifact {}", artifact.digest)))?;
                Ok((row, false))
            }
        }
    }

    /// The artifact with `id`.
    pub async fn get_by_id(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<ArtifactRow> {
        sqlx::query_as::<_, ArtifactRow>("SELECT * FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("artifact {id}")))
    }

    /// The artifact with `digest` in a repository, if stored there.
    pub async fn get_by_digest(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<ArtifactRow>> {
        Ok(sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM artifacts WHERE repository_id = ? AND digest = ?",
        )
        .bind(repository_id)
        .bind(digest)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// The artifacts of a repository among `digests`.
    pub async fn get_by_digests(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        digests: &[String],
    ) -> MetadataResult<Vec<ArtifactRow>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM artifacts WHERE repository_id = ");
        query.push_bind(repository_id).push(" AND digest IN (");
        let mut separated = query.separated(", ");
        for digest in digests {
            separated.push_bind(digest.clone());
        }
        separated.push_unseparated(")");
        Ok(query
            .build_query_as::<ArtifactRow>()
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Record that an artifact references `blob_ids`.
    pub async fn associate_blobs(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
        blob_ids: &[i64],
    ) -> MetadataResult<()> {
        for blob_id in blob_ids {
            sqlx::query("INSERT OR IGNORE INTO artifact_blobs (artifact_id, blob_id) VALUES (?, ?)")
                .bind(artifact_id)
                .bind(blob_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Record that an index references `child_ids`.
    pub async fn associate_artifacts(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
        child_ids: &[i64],
    ) -> MetadataResult<()> {
        for child_id in child_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO artifact_artifacts (artifact_id, child_id) VALUES (?, ?)",
            )
            .bind(artifact_id)
            .bind(child_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Artifacts in a repository whose subject is `subject`, optionally
    /// restricted to the given artifact types.
    pub async fn referrers(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        subject: &str,
        artifact_types: &[String],
    ) -> MetadataResult<Vec<ArtifactRow>> {
        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT * FROM artifacts WHERE repository_id = ");
        query
            .push_bind(repository_id)
            .push(" AND subject_digest = ")
            .push_bind(subject.to_owned());
        if !artifact_types.is_empty() {
            query.push(" AND artifact_type IN (");
            let mut separated = query.separated(", ");
            for artifact_type in artifact_types {
                separated.push_bind(artifact_type.clone());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY id");
        Ok(query
            .build_query_as::<ArtifactRow>()
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Number of artifacts in a repository.
    pub async fn count_by_repository(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
    ) -> MetadataResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_one(&mut *conn)
                .await?,
        )
    }

    /// Number of artifacts across a namespace.
    pub async fn count_by_namespace(
        &self,
        conn: &mut SqliteConnection,
        namespace_id: i64,
    ) -> MetadataResult<i64> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM artifacts
            JOIN repositories ON artifacts.repository_id = repositories.id
            WHERE repositories.namespace_id = ?
            "#,
        )
        .bind(namespace_id)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// Count a pull.
    pub async fn incr_pull(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        sqlx::query("UPDATE artifacts SET pull_count = pull_count + 1, last_pull = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Artifacts in a repository ordered by digest, after `page.last`.
    pub async fn list(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        page: &Pagination,
    ) -> MetadataResult<Vec<ArtifactRow>> {
        Ok(sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM artifacts WHERE repository_id = ? AND digest > ? ORDER BY digest LIMIT ?",
        )
        .bind(repository_id)
        .bind(page.last.as_deref().unwrap_or(""))
        .bind(page.limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Delete an artifact; its tags go with it and the counters follow.
    #[tracing::instrument(skip(self, conn))]
    pub async fn delete(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        let artifact = self.get_by_id(conn, id).await?;
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE artifact_id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;

        sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        let repositories = Repositories;
        if tags > 0 {
            repositories
                .decr_tag_count(conn, artifact.repository_id, tags)
                .await?;
        }
        repositories
            .sub_size(conn, artifact.repository_id, artifact.size)
            .await
    }

    /// Insert or replace the SBOM record of an artifact.
    pub async fn save_sbom(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
        record: &ScanRecord,
    ) -> MetadataResult<ArtifactSbomRow> {
        let now = Utc::now();
        Ok(sqlx::query_as::<_, ArtifactSbomRow>(
            r#"
            INSERT INTO artifact_sboms (artifact_id, raw, result, status, message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (artifact_id) DO UPDATE SET
                raw = excluded.raw,
                result = excluded.result,
                status = excluded.status,
                message = excluded.message,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(artifact_id)
        .bind(&record.raw)
        .bind(&record.result)
        .bind(record.status)
        .bind(&record.message)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// The SBOM record of an artifact, if any.
    pub async fn get_sbom(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
    ) -> MetadataResult<Option<ArtifactSbomRow>> {
        Ok(
            sqlx::query_as::<_, ArtifactSbomRow>("SELECT * FROM artifact_sboms WHERE artifact_id = ?")
                .bind(artifact_id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Insert or replace the vulnerability record of an artifact.
    pub async fn save_vulnerability(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
        metadata: Option<&str>,
        record: &ScanRecord,
    ) -> MetadataResult<ArtifactVulnerabilityRow> {
        let now = Utc::now();
        Ok(sqlx::query_as::<_, ArtifactVulnerabilityRow>(
            r#"
            INSERT INTO artifact_vulnerabilities (
                artifact_id, metadata, raw, result, status, message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (artifact_id) DO UPDATE SET
                metadata = excluded.metadata,
                raw = excluded.raw,
                result = excluded.result,
                status = excluded.status,
                message = excluded.message,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(artifact_id)
        .bind(metadata)
        .bind(&record.raw)
        .bind(&record.result)
        .bind(record.status)
        .bind(&record.message)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// The vulnerability record of an artifact, if any.
    pub async fn get_vulnerability(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
    ) -> MetadataResult<Option<ArtifactVulnerabilityRow>> {
        Ok(sqlx::query_as::<_, ArtifactVulnerabilityRow>(
            "SELECT * FROM artifact_vulnerabilities WHERE artifact_id = ?",
        )
        .bind(artifact_id)
        .fetch_optional(&mut *conn)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::models::{Limits, ScanStatus};
    use crate::metadata::testing;
    use crate::metadata::{Blobs, Namespaces};

    fn artifact(repository_id: i64, digest: &str, subject: Option<&str>) -> NewArtifact {
        NewArtifact {
            repository_id,
            digest: digest.into(),
            media_type: "application/vnd.oci.image.manifest.v1+json".into(),
            artifact_type: subject.map(|_| "application/vnd.example.sbom".into()),
            config_media_type: Some("application/vnd.oci.image.config.v1+json".into()),
            subject_digest: subject.map(Into::into),
            raw: b"{}".to_vec(),
            size: 10,
        }
    }

    #[tokio::test]
    async fn save_reports_whether_it_inserted() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();

        let (first, inserted) = Artifacts
            .save(&mut conn, &artifact(repository.id, "sha256:aa", None))
            .await
            .unwrap();
        assert!(inserted);
        let (second, inserted) = Artifacts
            .save(&mut conn, &artifact(repository.id, "sha256:aa", None))
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(first.id, second.id);
        assert_eq!(Artifacts.count_by_repository(&mut conn, repository.id).await.unwrap(), 1);
        assert_eq!(Artifacts.count_by_namespace(&mut conn, namespace.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn referrers_filter_by_type() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();

        Artifacts
            .save(&mut conn, &artifact(repository.id, "sha256:bb", Some("sha256:aa")))
            .await
            .unwrap();

        let all = Artifacts
            .referrers(&mut conn, repository.id, "sha256:aa", &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let none = Artifacts
            .referrers(
                &mut conn,
                repository.id,
                "sha256:aa",
                &["application/vnd.example.signature".into()],
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_tags_and_counters() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;

        let mut tx = store.transaction().await.unwrap();
        let (row, _) = Artifacts
            .save(&mut tx, &artifact(repository.id, "sha256:aa", None))
            .await
            .unwrap();
        Repositories.add_size(&mut tx, repository.id, row.size).await.unwrap();
        let blob = Blobs
            .create(&mut tx, "sha256:cc", 5, "application/octet-stream")
            .await
            .unwrap();
        Artifacts.associate_blobs(&mut tx, row.id, &[blob.id]).await.unwrap();
        crate::metadata::Tags
            .save(&mut tx, repository.id, row.id, "latest")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.transaction().await.unwrap();
        Artifacts.delete(&mut tx, row.id).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = store.connection().await.unwrap();
        let namespace = Namespaces.get(&mut conn, namespace.id).await.unwrap();
        assert_eq!(namespace.tag_count, 0);
        assert_eq!(namespace.size, 0);
        assert!(
            crate::metadata::Tags
                .get_by_name(&mut conn, repository.id, "latest")
                .await
                .unwrap()
                .is_none()
        );
        // blobs are shared and outlive the artifact
        assert!(Blobs.exists(&mut conn, "sha256:cc").await.unwrap());
    }

    #[tokio::test]
    async fn scan_records_are_replaced() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();
        let (row, _) = Artifacts
            .save(&mut conn, &artifact(repository.id, "sha256:aa", None))
            .await
            .unwrap();

        let pending = ScanRecord {
            raw: None,
            result: None,
            status: ScanStatus::Pending,
            message: None,
        };
        Artifacts.save_sbom(&mut conn, row.id, &pending).await.unwrap();
        let done = ScanRecord {
            status: ScanStatus::Success,
            result: Some("{}".into()),
            ..pending
        };
        let sbom = Artifacts.save_sbom(&mut conn, row.id, &done).await.unwrap();
        assert_eq!(sbom.status, ScanStatus::Success);

        Artifacts
            .save_vulnerability(&mut conn, row.id, Some("{\"scanner\":\"trivy\"}"), &done)
            .await
            .unwrap();
        let vulnerability = Artifacts
            .get_vulnerability(&mut conn, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vulnerability.result.as_deref(), Some("{}"));
        assert!(Artifacts.get_sbom(&mut conn, row.id).await.unwrap().is_some());
    }
}
