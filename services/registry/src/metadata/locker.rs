use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use super::{MetadataError, MetadataResult};
use crate::config::LockerConfig;

/// Named mutual exclusion backed by the `lockers` table.
///
/// Acquire locks before beginning a transaction; the guard uses its own
/// pooled connection.
#[derive(Debug, Clone)]
pub struct Locker {
    pool: SqlitePool,
    config: LockerConfig,
}

impl Locker {
    /// Locks stored through `pool`, acquired per `config`.
    pub fn new(pool: SqlitePool, config: LockerConfig) -> Self {
        Self { pool, config }
    }

    /// Take the lock called `name`, waiting between attempts while it is held.
    #[tracing::instrument(skip(self))]
    pub async fn lock(&self, name: &str) -> MetadataResult<LockGuard> {
        let attempts = self.config.attempts.max(1);
        let delay = Duration::from_millis(self.config.backoff_ms);

        for attempt in 1..=attempts {
            let result = sqlx::query("INSERT INTO lockers (name, created_at) VALUES (?, ?)")
                .bind(name)
                .bind(Utc::now())
                .execute(&self.pool)
                .await;

            match result.map_err(MetadataError::from) {
                Ok(_) => {
                    tracing::trace!(attempt, "lock acquired");
                    return Ok(LockGuard {
                        pool: self.pool.clone(),
                        name: name.to_owned(),
                        released: false,
                    });
                }
                Err(MetadataError::AlreadyExists(_)) if attempt < attempts => {
                    tracing::debug!(attempt, "lock busy, waiting");
                    tokio::time::sleep(delay).await;
                }
                Err(MetadataError::AlreadyExists(_)) => break,
                Err(err) => return Err(err),
            }
        }

        Err(MetadataError::Conflict(format!(
            "lock {name} still held after {attempts} attempts"
        )))
    }
}

/// A held lock. Call [`LockGuard::release`]; dropping it releases in the background.
#[derive(Debug)]
pub struct LockGuard {
    pool: SqlitePool,
    name: String,
    released: bool,
}

impl LockGuard {
    /// The lock's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock now.
    pub async fn release(mut self) -> MetadataResult<()> {
        self.released = true;
        sqlx::query("DELETE FROM lockers WHERE name = ?")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        tracing::trace!(name = %self.name, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(name = %self.name, "lock dropped outside a runtime and left held");
            return;
        };
        let pool = self.pool.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            if let Err(error) = sqlx::query("DELETE FROM lockers WHERE name = ?")
                .bind(&name)
                .execute(&pool)
                .await
            {
                tracing::warn!(%name, %error, "failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::testing;

    fn quick(store: &crate::metadata::MetadataStore) -> Locker {
        Locker::new(
            store.pool().clone(),
            LockerConfig {
                attempts: 2,
                backoff_ms: 1,
            },
        )
    }

    #[tokio::test]
    async fn held_lock_conflicts() {
        let store = testing::store().await;
        let locker = quick(&store);

        let guard = locker.lock("tag:lib/app:v1").await.unwrap();
        let err = locker.lock("tag:lib/app:v1").await.unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(_)));

        // other names are independent
        locker.lock("tag:lib/app:v2").await.unwrap().release().await.unwrap();

        guard.release().await.unwrap();
        locker.lock("tag:lib/app:v1").await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let store = testing::store().await;
        let locker = Locker::new(
            store.pool().clone(),
            LockerConfig {
                attempts: 50,
                backoff_ms: 5,
            },
        );
        let guard = locker.lock("name").await.unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.lock("name").await.map(|g| g.name().to_owned()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "name");
    }
}
