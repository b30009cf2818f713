use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::models::{NewRepository, Pagination, RepositoryRow, RepositoryUpdate};
use super::namespace::Namespaces;
use super::{MetadataError, MetadataResult};

/// Repository records and their per-repository counters.
#[derive(Debug, Clone, Copy)]
pub struct Repositories;

impl Repositories {
    /// Insert a repository, charging it against the namespace repository quota.
    ///
    /// The row is inserted before the quota is charged, so a duplicate name
    /// leaves the counter alone and the transaction usable. A quota failure
    /// must roll the transaction back.
    #[tracing::instrument(skip(self, conn, repository), fields(name = %repository.name))]
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        repository: &NewRepository,
    ) -> MetadataResult<RepositoryRow> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (namespace_id, name, description, visibility, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(repository.namespace_id)
        .bind(&repository.name)
        .bind(&repository.description)
        .bind(repository.visibility)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| match MetadataError::from(err) {
            MetadataError::AlreadyExists(_) => {
                MetadataError::AlreadyExists(format!("repository {}", repository.name))
            }
            other => other,
        })?;

        Namespaces
            .incr_repository_count(conn, repository.namespace_id)
            .await?;

        tracing::info!(id = row.id, "repository created");
        Ok(row)
    }

    /// The repository with `id`.
    pub async fn get(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<RepositoryRow> {
        sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("repository {id}")))
    }

    /// The repository called `name`, if any.
    pub async fn get_by_name(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> MetadataResult<Option<RepositoryRow>> {
        Ok(
            sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Repository names in lexical order, after `page.last`.
    ///
    /// With `namespace_id` set only that namespace is listed.
    pub async fn list(
        &self,
        conn: &mut SqliteConnection,
        namespace_id: Option<i64>,
        page: &Pagination,
    ) -> MetadataResult<Vec<RepositoryRow>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM repositories WHERE name > ");
        query.push_bind(page.last.clone().unwrap_or_default());
        if let Some(namespace_id) = namespace_id {
            query.push(" AND namespace_id = ").push_bind(namespace_id);
        }
        query.push(" ORDER BY name LIMIT ").push_bind(page.limit);

        Ok(query
            .build_query_as::<RepositoryRow>()
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Apply the set fields of `update`.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        update: &RepositoryUpdate,
    ) -> MetadataResult<RepositoryRow> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE repositories SET updated_at = ");
        query.push_bind(Utc::now());
        if let Some(description) = &update.description {
            query.push(", description = ").push_bind(description.clone());
        }
        if let Some(overview) = &update.overview {
            query.push(", overview = ").push_bind(overview.clone());
        }
        if let Some(visibility) = update.visibility {
            query.push(", visibility = ").push_bind(visibility);
        }
        if let Some(limit) = update.tag_limit {
            query.push(", tag_limit = ").push_bind(limit);
        }
        if let Some(limit) = update.size_limit {
            query.push(", size_limit = ").push_bind(limit);
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("repository {id}")));
        }
        self.resync(conn, id).await
    }

    /// Delete a repository and release what it held against its namespace.
    #[tracing::instrument(skip(self, conn))]
    pub async fn delete(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        let repository = self.get(conn, id).await?;
        sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        let namespaces = Namespaces;
        namespaces
            .decr_repository_count(conn, repository.namespace_id)
            .await?;
        namespaces
            .decr_tag_count(conn, repository.namespace_id, repository.tag_count)
            .await?;
        namespaces
            .sub_size(conn, repository.namespace_id, repository.size)
            .await?;
        Ok(())
    }

    /// Bump the repository and namespace tag counts, honouring both limits.
    pub async fn incr_tag_count(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET tag_count = tag_count + 1, updated_at = ?
            WHERE id = ? AND (tag_limit = 0 OR tag_count < tag_limit)
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        let repository = self.checked(conn, id, result.rows_affected(), "tag").await?;
        Namespaces
            .incr_tag_count(conn, repository.namespace_id)
            .await
    }

    /// Release one tag here and in the namespace.
    pub async fn decr_tag_count(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        by: i64,
    ) -> MetadataResult<()> {
        let repository = self.get(conn, id).await?;
        sqlx::query(
            "UPDATE repositories SET tag_count = MAX(tag_count - ?, 0), updated_at = ? WHERE id = ?",
        )
        .bind(by)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Namespaces
            .decr_tag_count(conn, repository.namespace_id, by)
            .await
    }

    /// Add `delta` bytes to the repository and namespace size, honouring both limits.
    pub async fn add_size(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        delta: i64,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET size = size + ?, updated_at = ?
            WHERE id = ? AND (size_limit = 0 OR size + ? <= size_limit)
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(id)
        .bind(delta)
        .execute(&mut *conn)
        .await?;
        let repository = self.checked(conn, id, result.rows_affected(), "size").await?;
        Namespaces.add_size(conn, repository.namespace_id, delta).await
    }

    /// Release `size` bytes here and in the namespace.
    pub async fn sub_size(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        delta: i64,
    ) -> MetadataResult<()> {
        let repository = self.get(conn, id).await?;
        sqlx::query("UPDATE repositories SET size = MAX(size - ?, 0), updated_at = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Namespaces.sub_size(conn, repository.namespace_id, delta).await
    }

    /// Recompute tag count and size from the tag and artifact rows.
    pub async fn resync(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> MetadataResult<RepositoryRow> {
        sqlx::query(
            r#"
            UPDATE repositories SET
                tag_count = (SELECT COUNT(*) FROM tags WHERE repository_id = repositories.id),
                size = (SELECT COALESCE(SUM(size), 0) FROM artifacts WHERE repository_id = repositories.id)
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;
        self.get(conn, id).await
    }

    async fn checked(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        rows: u64,
        what: &str,
    ) -> MetadataResult<RepositoryRow> {
        let repository = self.get(conn, id).await?;
        if rows > 0 {
            return Ok(repository);
        }
        Err(MetadataError::QuotaExceeded(format!(
            "repository {} {what} limit reached",
            repository.name
        )))
    }
}
