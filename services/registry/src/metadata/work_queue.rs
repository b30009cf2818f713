use chrono::Utc;
use sqlx::SqliteConnection;

use super::models::{WorkQueueRow, WorkQueueStatus};
use super::{MetadataError, MetadataResult};

/// Durable background tasks, claimed by optimistic version checks.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueue;

impl WorkQueue {
    /// Enqueue a pending task on `topic`.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        topic: &str,
        payload: &str,
    ) -> MetadataResult<WorkQueueRow> {
        let now = Utc::now();
        Ok(sqlx::query_as::<_, WorkQueueRow>(
            r#"
            INSERT INTO work_queues (topic, payload, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(topic)
        .bind(payload)
        .bind(WorkQueueStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?)
    }

    /// The oldest pending task, optionally limited to one topic.
    pub async fn get_oldest_pending(
        &self,
        conn: &mut SqliteConnection,
        topic: Option<&str>,
    ) -> MetadataResult<Option<WorkQueueRow>> {
        Ok(sqlx::query_as::<_, WorkQueueRow>(
            r#"
            SELECT * FROM work_queues
            WHERE status = ? AND (? IS NULL OR topic = ?)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(WorkQueueStatus::Pending)
        .bind(topic)
        .bind(topic)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// The task with `id`.
    pub async fn get(&self, conn: &mut SqliteConnection, id: i64) -> MetadataResult<WorkQueueRow> {
        sqlx::query_as::<_, WorkQueueRow>("SELECT * FROM work_queues WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("work item {id}")))
    }

    /// Move a task to `status` if it is still at `version`.
    ///
    /// Fails with `NotFound` when another worker got there first.
    pub async fn update_status(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        version: i64,
        status: WorkQueueStatus,
    ) -> MetadataResult<WorkQueueRow> {
        let attempt = i64::from(status == WorkQueueStatus::Doing);
        sqlx::query_as::<_, WorkQueueRow>(
            r#"
            UPDATE work_queues SET status = ?, version = version + 1, times = times + ?, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(attempt)
        .bind(Utc::now())
        .bind(id)
        .bind(version)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("work item {id} at version {version}")))
    }
}
