//! Transactional metadata for namespaces, repositories, content and uploads.
//!
//! Every service method takes a `&mut SqliteConnection`, so the caller picks
//! the scope: a pooled connection for a single statement, or an open
//! [`Transaction`] (via `&mut *tx`) when several writes must commit together.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use storage::Backoff;

mod artifact;
mod blob;
mod error;
mod locker;
/// Row and input types.
pub mod models;
mod namespace;
mod repository;
mod tag;
mod upload;
mod work_queue;

pub use artifact::Artifacts;
pub use blob::Blobs;
pub use error::{MetadataError, MetadataResult, Transient};
pub use locker::{LockGuard, Locker};
pub use namespace::Namespaces;
pub use repository::Repositories;
pub use tag::Tags;
pub use upload::BlobUploads;
pub use work_queue::WorkQueue;

use crate::config::{DatabaseConfig, LockerConfig};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS namespaces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        visibility TEXT NOT NULL DEFAULT 'private',
        repository_limit INTEGER NOT NULL DEFAULT 0,
        repository_count INTEGER NOT NULL DEFAULT 0 CHECK (repository_count >= 0),
        tag_limit INTEGER NOT NULL DEFAULT 0,
        tag_count INTEGER NOT NULL DEFAULT 0 CHECK (tag_count >= 0),
        size_limit INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace_id INTEGER NOT NULL REFERENCES namespaces(id) ON DELETE CASCADE,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        overview TEXT,
        visibility TEXT NOT NULL DEFAULT 'private',
        tag_limit INTEGER NOT NULL DEFAULT 0,
        tag_count INTEGER NOT NULL DEFAULT 0 CHECK (tag_count >= 0),
        size_limit INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_repositories_namespace ON repositories(namespace_id)",
    r#"
    CREATE TABLE IF NOT EXISTS blobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        digest TEXT NOT NULL UNIQUE,
        size INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        pull_count INTEGER NOT NULL DEFAULT 0,
        last_pull TEXT,
        pushed_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        digest TEXT NOT NULL,
        media_type TEXT NOT NULL,
        artifact_type TEXT,
        config_media_type TEXT,
        subject_digest TEXT,
        raw BLOB NOT NULL,
        size INTEGER NOT NULL,
        pull_count INTEGER NOT NULL DEFAULT 0,
        last_pull TEXT,
        pushed_at TEXT NOT NULL,
        UNIQUE (repository_id, digest)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_artifacts_subject ON artifacts(repository_id, subject_digest)",
    r#"
    CREATE TABLE IF NOT EXISTS artifact_blobs (
        artifact_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        blob_id INTEGER NOT NULL REFERENCES blobs(id),
        PRIMARY KEY (artifact_id, blob_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_artifact_blobs_blob ON artifact_blobs(blob_id)",
    r#"
    CREATE TABLE IF NOT EXISTS artifact_artifacts (
        artifact_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        child_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        PRIMARY KEY (artifact_id, child_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifact_sboms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artifact_id INTEGER NOT NULL UNIQUE REFERENCES artifacts(id) ON DELETE CASCADE,
        raw BLOB,
        result TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifact_vulnerabilities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artifact_id INTEGER NOT NULL UNIQUE REFERENCES artifacts(id) ON DELETE CASCADE,
        metadata TEXT,
        raw BLOB,
        result TEXT,
        status TEXT NOT NULL,
        message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        artifact_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        pull_count INTEGER NOT NULL DEFAULT 0,
        last_pull TEXT,
        pushed_at TEXT NOT NULL,
        UNIQUE (repository_id, name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tags_artifact ON tags(artifact_id)",
    r#"
    CREATE TABLE IF NOT EXISTS blob_uploads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id TEXT NOT NULL,
        part_number INTEGER NOT NULL,
        repository TEXT NOT NULL,
        file_id TEXT NOT NULL,
        etag TEXT NOT NULL,
        size INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (upload_id, part_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_queues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        version INTEGER NOT NULL DEFAULT 0,
        times INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_work_queues_topic ON work_queues(topic, status, id)",
    r#"
    CREATE TABLE IF NOT EXISTS lockers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS casbin_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ptype TEXT NOT NULL,
        v0 TEXT NOT NULL DEFAULT '',
        v1 TEXT NOT NULL DEFAULT '',
        v2 TEXT NOT NULL DEFAULT '',
        v3 TEXT NOT NULL DEFAULT '',
        v4 TEXT NOT NULL DEFAULT '',
        v5 TEXT NOT NULL DEFAULT ''
    )
    "#,
];

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    locker: LockerConfig,
    backoff: Backoff,
}

impl MetadataStore {
    /// Open (and migrate) the database named by `config`.
    #[tracing::instrument(skip_all, fields(url = %config.url))]
    pub async fn connect(config: &DatabaseConfig, locker: LockerConfig) -> MetadataResult<Self> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let opts = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = if in_memory {
            // Every connection to `:memory:` is a separate database, so keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .connect_with(
                    opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal),
                )
                .await?
        };

        let store = Self {
            pool,
            locker,
            backoff: Backoff::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// A fresh in-memory store, used by tests.
    pub async fn in_memory() -> MetadataResult<Self> {
        Self::connect(&DatabaseConfig::default(), LockerConfig::default()).await
    }

    /// Set the backoff used by [`MetadataStore::retry`].
    pub fn with_retry(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `operation`, running it again while it fails with a transient
    /// error (a busy or locked database, a pool timeout).
    ///
    /// `operation` must be a whole unit of work: a transaction that failed
    /// part way is rolled back, so it is begun afresh on every attempt. Once
    /// the backoff reaches its cap, the last error is returned.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let mut next = Some(self.backoff.clone());
        let mut attempt = 1u32;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            let Some(current) = next.filter(|b| b.delay < b.max_delay) else {
                tracing::warn!(attempt, error = %err, "metadata store still busy, giving up");
                return Err(err);
            };

            tracing::debug!(attempt, delay = ?current.delay, error = %err, "retrying metadata operation");
            tokio::time::sleep(current.delay).await;
            next = current.increment();
            attempt += 1;
        }
    }

    /// Create every table and index which does not exist yet.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!("metadata schema ready");
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// A pooled connection for statements which need no transaction.
    pub async fn connection(&self) -> MetadataResult<sqlx::pool::PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Begin a transaction; dropping it without `commit` rolls back.
    pub async fn transaction(&self) -> MetadataResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Namespace records.
    pub fn namespaces(&self) -> Namespaces {
        Namespaces
    }

    /// Repository records.
    pub fn repositories(&self) -> Repositories {
        Repositories
    }

    /// Blob records.
    pub fn blobs(&self) -> Blobs {
        Blobs
    }

    /// Upload session parts.
    pub fn uploads(&self) -> BlobUploads {
        BlobUploads
    }

    /// Artifacts and their links.
    pub fn artifacts(&self) -> Artifacts {
        Artifacts
    }

    /// Tag bindings.
    pub fn tags(&self) -> Tags {
        Tags
    }

    /// The durable work queue.
    pub fn work_queue(&self) -> WorkQueue {
        WorkQueue
    }

    /// Named locks.
    pub fn locker(&self) -> Locker {
        Locker::new(self.pool.clone(), self.locker.clone())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(5), 2, Duration::from_secs(2))
    }

    async fn file_store(dir: &tempfile::TempDir, busy_timeout_ms: u64) -> MetadataStore {
        let url = format!("sqlite://{}", dir.path().join("registry.db").display());
        MetadataStore::connect(
            &DatabaseConfig {
                url,
                max_connections: 4,
                busy_timeout_ms,
            },
            LockerConfig::default(),
        )
        .await
        .unwrap()
        .with_retry(fast())
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_errors() {
        let store = MetadataStore::in_memory().await.unwrap().with_retry(fast());
        let calls = AtomicU32::new(0);
        let err = store
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MetadataError::NotFound("row".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let value = store
            .retry(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MetadataError::from(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(3)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_once_backoff_is_spent() {
        let store = MetadataStore::in_memory()
            .await
            .unwrap()
            .with_retry(Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(8)));
        let calls = AtomicU32::new(0);
        let err = store
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MetadataError::from(sqlx::Error::PoolTimedOut))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // delays of 1, 2 and 4 ms
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_database_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir, 0).await;

        let mut holder = store.connection().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

        let attempts = std::sync::Arc::new(AtomicU32::new(0));
        let writer = {
            let store = store.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move {
                store
                    .retry(|| async {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        let mut conn = store.connection().await?;
                        sqlx::query("INSERT INTO lockers (name, created_at) VALUES ('busy', ?)")
                            .bind(chrono::Utc::now())
                            .execute(&mut *conn)
                            .await?;
                        Ok::<_, MetadataError>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        sqlx::query("COMMIT").execute(&mut *holder).await.unwrap();
        drop(holder);

        writer.await.unwrap().unwrap();
        assert!(attempts.load(Ordering::SeqCst) > 1);
    }
}
