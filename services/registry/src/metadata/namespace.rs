use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::models::{Limits, NamespaceRow, NamespaceUpdate, NewNamespace, Pagination};
use super::{MetadataError, MetadataResult};

/// Role granted full control over a namespace when it is created.
pub const NAMESPACE_ADMIN: &str = "namespace_admin";

/// Namespace records and their quota counters.
#[derive(Debug, Clone, Copy)]
pub struct Namespaces;

impl Namespaces {
    /// Insert a namespace and its administrative policy rule.
    ///
    /// Run inside a transaction so both rows commit together.
    #[tracing::instrument(skip(self, conn, namespace), fields(name = %namespace.name))]
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        namespace: &NewNamespace,
    ) -> MetadataResult<NamespaceRow> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, NamespaceRow>(
            r#"
            INSERT INTO namespaces (
                name, description, visibility, repository_limit, tag_limit, size_limit,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&namespace.name)
        .bind(&namespace.description)
        .bind(namespace.visibility)
        .bind(namespace.limits.repository_limit)
        .bind(namespace.limits.tag_limit)
        .bind(namespace.limits.size_limit)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| match MetadataError::from(err) {
            MetadataError::AlreadyExists(_) => {
                MetadataError::AlreadyExists(format!("namespace {}", namespace.name))
            }
            other => other,
        })?;

        sqlx::query("INSERT INTO casbin_rules (ptype, v0, v1, v2, v3) VALUES ('p', ?, ?, '*', '*')")
            .bind(NAMESPACE_ADMIN)
            .bind(&namespace.name)
            .execute(&mut *conn)
            .await?;

        tracing::info!(id = row.id, "namespace created");
        Ok(row)
    }

    /// The namespace with `id`.
    pub async fn get(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<NamespaceRow> {
        sqlx::query_as::<_, NamespaceRow>("SELECT * FROM namespaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("namespace {id}")))
    }

    /// The namespace called `name`, if any.
    pub async fn get_by_name(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> MetadataResult<Option<NamespaceRow>> {
        Ok(
            sqlx::query_as::<_, NamespaceRow>("SELECT * FROM namespaces WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Namespaces ordered by name, after `page.last`.
    pub async fn list(
        &self,
        conn: &mut SqliteConnection,
        page: &Pagination,
    ) -> MetadataResult<Vec<NamespaceRow>> {
        Ok(sqlx::query_as::<_, NamespaceRow>(
            "SELECT * FROM namespaces WHERE name > ? ORDER BY name LIMIT ?",
        )
        .bind(page.last.as_deref().unwrap_or(""))
        .bind(page.limit)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Apply the set fields of `update`.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        update: &NamespaceUpdate,
    ) -> MetadataResult<NamespaceRow> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE namespaces SET updated_at = ");
        query.push_bind(Utc::now());
        if let Some(description) = &update.description {
            query.push(", description = ").push_bind(description.clone());
        }
        if let Some(visibility) = update.visibility {
            query.push(", visibility = ").push_bind(visibility);
        }
        if let Some(limit) = update.repository_limit {
            query.push(", repository_limit = ").push_bind(limit);
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
            return Err(MetadataError::NotFound(format!("namespace {id}")));
        }
        self.resync(conn, id).await
    }

    /// Replace all three quota limits.
    pub async fn update_quota(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        limits: Limits,
    ) -> MetadataResult<NamespaceRow> {
        self.update(
            conn,
            id,
            &NamespaceUpdate {
                repository_limit: Some(limits.repository_limit),
                tag_limit: Some(limits.tag_limit),
                size_limit: Some(limits.size_limit),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a namespace; repositories and their content cascade.
    pub async fn delete(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        let namespace = self.get(conn, id).await?;
        sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM casbin_rules WHERE ptype = 'p' AND v0 = ? AND v1 = ?")
            .bind(NAMESPACE_ADMIN)
            .bind(&namespace.name)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Bump `repository_count`, failing when the limit would be exceeded.
    pub async fn incr_repository_count(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE namespaces SET repository_count = repository_count + 1, updated_at = ?
            WHERE id = ? AND (repository_limit = 0 OR repository_count < repository_limit)
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        self.checked(conn, id, result.rows_affected(), "repository").await
    }

    /// Release one repository from the quota.
    pub async fn decr_repository_count(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE namespaces SET repository_count = MAX(repository_count - 1, 0), updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Bump `tag_count`, failing when the limit would be exceeded.
    pub async fn incr_tag_count(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE namespaces SET tag_count = tag_count + 1, updated_at = ?
            WHERE id = ? AND (tag_limit = 0 OR tag_count < tag_limit)
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        self.checked(conn, id, result.rows_affected(), "tag").await
    }

    /// Release one tag from the quota.
    pub async fn decr_tag_count(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        by: i64,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE namespaces SET tag_count = MAX(tag_count - ?, 0), updated_at = ? WHERE id = ?")
            .bind(by)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Add `delta` bytes to the namespace size, failing when the limit would be exceeded.
    pub async fn add_size(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        delta: i64,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE namespaces SET size = size + ?, updated_at = ?
            WHERE id = ? AND (size_limit = 0 OR size + ? <= size_limit)
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(id)
        .bind(delta)
        .execute(&mut *conn)
        .await?;
        self.checked(conn, id, result.rows_affected(), "size").await
    }

    /// Release `size` bytes from the quota.
    pub async fn sub_size(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        delta: i64,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE namespaces SET size = MAX(size - ?, 0), updated_at = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Recompute counters from the rows they summarise.
    pub async fn resync(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<NamespaceRow> {
        sqlx::query(
            r#"
            UPDATE namespaces SET
                repository_count = (SELECT COUNT(*) FROM repositories WHERE namespace_id = namespaces.id),
                tag_count = (
                    SELECT COUNT(*) FROM tags JOIN repositories ON tags.repository_id = repositories.id
                    WHERE repositories.namespace_id = namespaces.id
                ),
                size = (
                    SELECT COALESCE(SUM(artifacts.size), 0) FROM artifacts
                    JOIN repositories ON artifacts.repository_id = repositories.id
                    WHERE repositories.namespace_id = namespaces.id
                )
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
    ) -> MetadataResult<()> {
        if rows > 0 {
            return Ok(());
        }
        let namespace = self.get(conn, id).await?;
        Err(MetadataError::QuotaExceeded(format!(
            "namespace {} {what} limit reached",
            namespace.name
        )))
    }
}
