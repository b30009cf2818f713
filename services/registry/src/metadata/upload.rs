use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::models::{BlobUploadRow, NewBlobUploadPart};
use super::{MetadataError, MetadataResult};

/// Part rows of in-flight blob upload sessions.
#[derive(Debug, Clone, Copy)]
pub struct BlobUploads;

impl BlobUploads {
    /// Record a part. Part 0 is the session anchor.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        part: &NewBlobUploadPart,
    ) -> MetadataResult<BlobUploadRow> {
        let now = Utc::now();
        Ok(sqlx::query_as::<_, BlobUploadRow>(
            r#"
            INSERT INTO blob_uploads (upload_id, part_number, repository, file_id, etag, size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&part.upload_id)
        .bind(part.part_number)
        .bind(&part.repository)
        .bind(&part.file_id)
        .bind(&part.etag)
        .bind(part.size)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// The anchor row of a session.
    pub async fn get_anchor(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<BlobUploadRow> {
        sqlx::query_as::<_, BlobUploadRow>(
            "SELECT * FROM blob_uploads WHERE upload_id = ? AND part_number = 0",
        )
        .bind(upload_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))
    }

    /// The highest-numbered row of a session; the anchor when no chunk has landed.
    pub async fn get_last_part(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<BlobUploadRow> {
        sqlx::query_as::<_, BlobUploadRow>(
            "SELECT * FROM blob_uploads WHERE upload_id = ? ORDER BY part_number DESC LIMIT 1",
        )
        .bind(upload_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("upload {upload_id}")))
    }

    /// Every row of a session, anchor first.
    pub async fn list_parts(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<Vec<BlobUploadRow>> {
        Ok(sqlx::query_as::<_, BlobUploadRow>(
            "SELECT * FROM blob_uploads WHERE upload_id = ? ORDER BY part_number",
        )
        .bind(upload_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Bytes received so far.
    pub async fn total_size(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM blob_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// Part etags in part order, excluding the anchor.
    pub async fn total_etags(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT etag FROM blob_uploads WHERE upload_id = ? AND part_number > 0 ORDER BY part_number",
        )
        .bind(upload_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Drop every row of a session.
    pub async fn delete_by_upload_id(
        &self,
        conn: &mut SqliteConnection,
        upload_id: &str,
    ) -> MetadataResult<()> {
        sqlx::query("DELETE FROM blob_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Anchors of sessions whose newest row predates `before`.
    pub async fn list_stale(
        &self,
        conn: &mut SqliteConnection,
        before: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<BlobUploadRow>> {
        Ok(sqlx::query_as::<_, BlobUploadRow>(
            r#"
            SELECT anchor.* FROM blob_uploads AS anchor
            WHERE anchor.part_number = 0
              AND (SELECT MAX(updated_at) FROM blob_uploads AS part WHERE part.upload_id = anchor.upload_id) < ?
            ORDER BY anchor.id
            LIMIT ?
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?)
    }
}
