use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::models::BlobRow;
use super::{MetadataError, MetadataResult};

/// Content-addressed blob records, shared across repositories.
#[derive(Debug, Clone, Copy)]
pub struct Blobs;

impl Blobs {
    /// Record a blob, or return the existing record for the same digest.
    ///
    /// Pushing an existing digest again refreshes `pushed_at`, restarting its
    /// collection grace period.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        digest: &str,
        size: i64,
        content_type: &str,
    ) -> MetadataResult<BlobRow> {
        sqlx::query(
            r#"
            INSERT INTO blobs (digest, size, content_type, pushed_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (digest) DO UPDATE SET pushed_at = excluded.pushed_at
            "#,
        )
        .bind(digest)
        .bind(size)
        .bind(content_type)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        self.find_by_digest(conn, digest)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("blob {digest}")))
    }

    /// The blob with `digest`, if recorded.
    pub async fn find_by_digest(
        &self,
        conn: &mut SqliteConnection,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        Ok(
            sqlx::query_as::<_, BlobRow>("SELECT * FROM blobs WHERE digest = ?")
                .bind(digest)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Every known blob among `digests`; missing ones are simply absent.
    pub async fn find_by_digests(
        &self,
        conn: &mut SqliteConnection,
        digests: &[String],
    ) -> MetadataResult<Vec<BlobRow>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM blobs WHERE digest IN (");
        let mut separated = query.separated(", ");
        for digest in digests {
            separated.push_bind(digest.clone());
        }
        separated.push_unseparated(")");
        Ok(query
            .build_query_as::<BlobRow>()
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Whether a blob with `digest` is recorded.
    pub async fn exists(&self, conn: &mut SqliteConnection, digest: &str) -> MetadataResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(found.is_some())
    }

    /// Count a pull.
    pub async fn incr_pull(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        sqlx::query("UPDATE blobs SET pull_count = pull_count + 1, last_pull = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete a blob row whether or not it is referenced.
    pub async fn delete_by_id(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete a blob row only while no artifact references it and it has
    /// been idle since `before`.
    ///
    /// Returns whether the row was removed.
    pub async fn delete_unreferenced(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        before: DateTime<Utc>,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM blobs
            WHERE id = ?
              AND NOT EXISTS (SELECT 1 FROM artifact_blobs WHERE artifact_blobs.blob_id = blobs.id)
              AND MAX(pushed_at, COALESCE(last_pull, pushed_at)) < ?
            "#,
        )
        .bind(id)
        .bind(before)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Blobs no artifact references whose last activity precedes `before`.
    pub async fn list_unreferenced(
        &self,
        conn: &mut SqliteConnection,
        before: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<BlobRow>> {
        Ok(sqlx::query_as::<_, BlobRow>(
            r#"
            SELECT * FROM blobs
            WHERE NOT EXISTS (SELECT 1 FROM artifact_blobs WHERE artifact_blobs.blob_id = blobs.id)
              AND MAX(pushed_at, COALESCE(last_pull, pushed_at)) < ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::testing;

    const DIGEST: &str =
        "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = testing::store().await;
        let mut conn = store.connection().await.unwrap();

        let first = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();
        let second = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(Blobs.exists(&mut conn, DIGEST).await.unwrap());
    }

    #[tokio::test]
    async fn repush_refreshes_pushed_at() {
        let store = testing::store().await;
        let mut conn = store.connection().await.unwrap();
        let blob = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();
        sqlx::query("UPDATE blobs SET pushed_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::days(30))
            .bind(blob.id)
            .execute(&mut *conn)
            .await
            .unwrap();

        let again = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(again.id, blob.id);
        assert!(again.pushed_at > Utc::now() - chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn find_by_digests_skips_unknown() {
        let store = testing::store().await;
        let mut conn = store.connection().await.unwrap();
        Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();

        let found = Blobs
            .find_by_digests(&mut conn, &[DIGEST.to_owned(), "sha256:missing".to_owned()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(
            Blobs
                .find_by_digests(&mut conn, &[])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn unreferenced_blobs_are_listed_once_idle() {
        let store = testing::store().await;
        let mut conn = store.connection().await.unwrap();
        let blob = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();

        let idle = Blobs
            .list_unreferenced(&mut conn, Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(idle.is_empty());

        let idle = Blobs
            .list_unreferenced(&mut conn, Utc::now() + chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(idle.len(), 1);

        Blobs.incr_pull(&mut conn, blob.id).await.unwrap();
        let blob = Blobs.find_by_digest(&mut conn, DIGEST).await.unwrap().unwrap();
        assert_eq!(blob.pull_count, 1);
        assert!(blob.last_pull.is_some());
    }

    #[tokio::test]
    async fn referenced_blobs_survive_delete_unreferenced() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Default::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();
        let blob = Blobs
            .create(&mut conn, DIGEST, 3, "application/octet-stream")
            .await
            .unwrap();
        let (artifact, _) = crate::metadata::Artifacts
            .save(
                &mut conn,
                &crate::metadata::models::NewArtifact {
                    repository_id: repository.id,
                    digest: "sha256:aa".into(),
                    media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                    artifact_type: None,
                    config_media_type: None,
                    subject_digest: None,
                    raw: b"{}".to_vec(),
                    size: 2,
                },
            )
            .await
            .unwrap();
        crate::metadata::Artifacts
            .associate_blobs(&mut conn, artifact.id, &[blob.id])
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(!Blobs.delete_unreferenced(&mut conn, blob.id, later).await.unwrap());
        crate::metadata::Artifacts.delete(&mut conn, artifact.id).await.unwrap();

        // pushed after the cutoff
        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert!(!Blobs.delete_unreferenced(&mut conn, blob.id, earlier).await.unwrap());
        assert!(Blobs.delete_unreferenced(&mut conn, blob.id, later).await.unwrap());
        assert!(!Blobs.exists(&mut conn, DIGEST).await.unwrap());
    }
}
