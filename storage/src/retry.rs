//! Retrying transient storage failures with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use storage_driver::{StorageError, StorageErrorKind};

/// A policy for retrying storage operations with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// The initial delay for the backoff
    pub delay: Duration,

    /// The exponent to increase the delay by
    pub exponent: u32,

    /// The maximum delay for the backoff
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            exponent: 2,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// A policy which never retries.
    pub fn none() -> Self {
        Self {
            delay: Duration::ZERO,
            exponent: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Increment the backoff delay, or `None` once the cap is reached.
    pub fn increment(&self) -> Option<Self> {
        let delay = self.delay.checked_mul(self.exponent)?;

        if delay >= self.max_delay {
            return None;
        }

        Some(Self {
            delay,
            exponent: self.exponent,
            max_delay: self.max_delay,
        })
    }
}

/// Run `operation`, retrying while it fails with a retryable error.
///
/// The first attempt runs immediately. Each retry sleeps for the current delay
/// and then grows it, until the delay would exceed `max_delay`, at which point the
/// last error is wrapped as [`StorageErrorKind::RetriesExhausted`].
pub async fn retry<T, F, Fut>(backoff: &Backoff, mut operation: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut next = Some(backoff.clone());
    let mut attempt = 1u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        let Some(current) = next.filter(|b| b.delay < b.max_delay) else {
            if attempt == 1 {
                return Err(err);
            }
            let engine = err.engine();
            return Err(StorageError::builder(engine, StorageErrorKind::RetriesExhausted, err)
                .context(format!("gave up after {attempt} attempts"))
                .build());
        };

        tracing::debug!(attempt, delay=?current.delay, error=%err, "retrying storage operation");
        tokio::time::sleep(current.delay).await;
        next = current.increment();
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(10))
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = fast();
        let delays: Vec<_> = std::iter::successors(Some(backoff), |b| b.increment())
            .map(|b| b.delay.as_millis())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let value = retry(&fast(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::new(
                    "test",
                    StorageErrorKind::ServiceUnavailable,
                    "busy",
                ))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry(&fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::new("test", StorageErrorKind::NotFound, "gone"))
        })
        .await
        .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_is_exhausted() {
        let err = retry(&fast(), || async {
            Err::<(), _>(StorageError::new("test", StorageErrorKind::Io, "flaky"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), StorageErrorKind::RetriesExhausted);
    }
}
