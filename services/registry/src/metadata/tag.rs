use chrono::Utc;
use sqlx::SqliteConnection;

use super::models::{Pagination, TagRow};
use super::repository::Repositories;
use super::{MetadataError, MetadataResult};

/// Tag bindings from a name to an artifact within one repository.
#[derive(Debug, Clone, Copy)]
pub struct Tags;

impl Tags {
    /// Bind `name` to `artifact_id`, creating the tag or moving an existing one.
    ///
    /// A new tag is charged against the repository and namespace tag quotas;
    /// rebinding is free. Returns the row and whether it was created.
    #[tracing::instrument(skip(self, conn))]
    pub async fn save(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        artifact_id: i64,
        name: &str,
    ) -> MetadataResult<(TagRow, bool)> {
        let now = Utc::now();
        if let Some(existing) = self.get_by_name(conn, repository_id, name).await? {
            let row = sqlx::query_as::<_, TagRow>(
                "UPDATE tags SET artifact_id = ?, pushed_at = ? WHERE id = ? RETURNING *",
            )
            .bind(artifact_id)
            .bind(now)
            .bind(existing.id)
            .fetch_one(&mut *conn)
            .await?;
            if existing.artifact_id != artifact_id {
                tracing::debug!(from = existing.artifact_id, to = artifact_id, "tag moved");
            }
            return Ok((row, false));
        }

        Repositories.incr_tag_count(conn, repository_id).await?;
        let row = sqlx::query_as::<_, TagRow>(
            r#"
            INSERT INTO tags (repository_id, artifact_id, name, pushed_at) VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(repository_id)
        .bind(artifact_id)
        .bind(name)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok((row, true))
    }

    /// The tag with `id`.
    pub async fn get_by_id(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<TagRow> {
        sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("tag {id}")))
    }

    /// The tag called `name` in a repository, if any.
    pub async fn get_by_name(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        name: &str,
    ) -> MetadataResult<Option<TagRow>> {
        Ok(
            sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE repository_id = ? AND name = ?")
                .bind(repository_id)
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Every tag pointing at an artifact.
    pub async fn list_by_artifact(
        &self,
        conn: &mut SqliteConnection,
        artifact_id: i64,
    ) -> MetadataResult<Vec<TagRow>> {
        Ok(
            sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE artifact_id = ? ORDER BY name")
                .bind(artifact_id)
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    /// Tag names of a repository in lexical order, after `page.last`.
    pub async fn list(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        page: &Pagination,
    ) -> MetadataResult<Vec<TagRow>> {
        Ok(sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE repository_id = ? AND name > ? ORDER BY name LIMIT ?",
        )
        .bind(repository_id)
        .bind(page.last.as_deref().unwrap_or(""))
        .bind(page.limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Number of tags in a repository.
    pub async fn count(&self, conn: &mut SqliteConnection, repository_id: i64) -> MetadataResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_one(&mut *conn)
                .await?,
        )
    }

    /// Count a pull.
    pub async fn incr_pull(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        sqlx::query("UPDATE tags SET pull_count = pull_count + 1, last_pull = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Remove a tag, leaving its artifact in place.
    pub async fn delete_by_name(
        &self,
        conn: &mut SqliteConnection,
        repository_id: i64,
        name: &str,
    ) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM tags WHERE repository_id = ? AND name = ?")
            .bind(repository_id)
            .bind(name)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("tag {name}")));
        }
        Repositories.decr_tag_count(conn, repository_id, 1).await
    }
}

#[cfg(test)]
mod tests {
    use sqlx::Connection;

    use super::*;
    use crate::metadata::models::{Limits, NewArtifact};
    use crate::metadata::{Artifacts, Namespaces, testing};

    async fn artifact(conn: &mut SqliteConnection, repository_id: i64, digest: &str) -> i64 {
        let (row, _) = Artifacts
            .save(
                conn,
                &NewArtifact {
                    repository_id,
                    digest: digest.into(),
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
        row.id
    }

    #[tokio::test]
    async fn rebinding_does_not_count_twice() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();
        let first = artifact(&mut conn, repository.id, "sha256:aa").await;
        let second = artifact(&mut conn, repository.id, "sha256:bb").await;

        let (_, created) = Tags.save(&mut conn, repository.id, first, "v1").await.unwrap();
        assert!(created);
        let (row, created) = Tags.save(&mut conn, repository.id, second, "v1").await.unwrap();
        assert!(!created);
        assert_eq!(row.artifact_id, second);

        let repository = Repositories.get(&mut conn, repository.id).await.unwrap();
        assert_eq!(repository.tag_count, 1);
        assert!(Tags.list_by_artifact(&mut conn, first).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tag_quota_rejects_new_names_only() {
        let store = testing::store().await;
        let namespace = testing::namespace(
            &store,
            "lib",
            Limits {
                tag_limit: 1,
                ..Default::default()
            },
        )
        .await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();
        let id = artifact(&mut conn, repository.id, "sha256:aa").await;

        Tags.save(&mut conn, repository.id, id, "v1").await.unwrap();
        Tags.save(&mut conn, repository.id, id, "v1").await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        let err = Tags.save(&mut tx, repository.id, id, "v2").await.unwrap_err();
        assert!(matches!(err, MetadataError::QuotaExceeded(_)));
        drop(tx);

        let repository = Repositories.get(&mut conn, repository.id).await.unwrap();
        assert_eq!(repository.tag_count, 1);
    }

    #[tokio::test]
    async fn list_and_delete() {
        let store = testing::store().await;
        let namespace = testing::namespace(&store, "lib", Limits::default()).await;
        let repository = testing::repository(&store, &namespace, "lib/app").await;
        let mut conn = store.connection().await.unwrap();
        let id = artifact(&mut conn, repository.id, "sha256:aa").await;
        for name in ["t3", "t1", "t2"] {
            Tags.save(&mut conn, repository.id, id, name).await.unwrap();
        }

        let page = Tags
            .list(&mut conn, repository.id, &Pagination::new(2, Some("t1".into())))
            .await
            .unwrap();
        let names: Vec<_> = page.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["t2", "t3"]);

        Tags.delete_by_name(&mut conn, repository.id, "t2").await.unwrap();
        assert_eq!(Tags.count(&mut conn, repository.id).await.unwrap(), 2);
        let err = Tags
            .delete_by_name(&mut conn, repository.id, "t2")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let namespace = Namespaces.get(&mut conn, namespace.id).await.unwrap();
        assert_eq!(namespace.tag_count, 2);
    }
}
