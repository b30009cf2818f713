//! Background work items, carried by the `work_queues` table.
//!
//! The [`Producer`] records tasks as part of request handling. A [`Consumer`]
//! claims them with the optimistic `(id, version)` update, so any number of
//! consumers may share one queue without double delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::metadata::models::{WorkQueueRow, WorkQueueStatus};
use crate::metadata::{MetadataError, MetadataResult, MetadataStore};

/// Topic for artifacts which were created by a manifest push.
pub const ARTIFACT_PUSHED: &str = "artifact.pushed";

/// Payload of an [`ARTIFACT_PUSHED`] task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPushed {
    /// Repository the manifest was pushed to.
    pub repository: String,
    /// Digest of the new artifact.
    pub digest: String,
    /// Its media type.
    pub media_type: String,
}

/// Enqueues work items.
#[derive(Debug, Clone)]
pub struct Producer {
    metadata: MetadataStore,
}

impl Producer {
    /// Enqueue into the work queue of `metadata`.
    pub fn new(metadata: MetadataStore) -> Self {
        Self { metadata }
    }

    /// Record a task for `topic` with `payload` serialized as JSON.
    #[tracing::instrument(skip(self, payload))]
    pub async fn enqueue<T: Serialize>(&self, topic: &str, payload: &T) -> MetadataResult<i64> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.metadata.connection().await?;
        let row = self
            .metadata
            .work_queue()
            .create(&mut conn, topic, &payload)
            .await?;
        tracing::debug!(id = row.id, "work item enqueued");
        Ok(row.id)
    }
}

/// Runs the tasks of one topic.
#[async_trait::async_trait]
pub trait TaskHandler: std::fmt::Debug + Send + Sync {
    /// Run one task; an error marks it failed.
    async fn handle(&self, payload: &str) -> eyre::Result<()>;
}

static_assertions::assert_obj_safe!(TaskHandler);

/// Polls the queue and hands tasks to their topic's handler.
#[derive(Debug, Clone)]
pub struct Consumer {
    metadata: MetadataStore,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    poll_interval: Duration,
}

impl Consumer {
    /// Consume from the work queue of `metadata`.
    pub fn new(metadata: MetadataStore) -> Self {
        Self {
            metadata,
            handlers: HashMap::new(),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Handle tasks for `topic` with `handler`.
    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    /// How long to wait when the queue is empty.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and run at most one task per registered topic.
    ///
    /// Returns how many tasks this consumer ran.
    pub async fn run_once(&self) -> MetadataResult<usize> {
        let queue = self.metadata.work_queue();
        let mut ran = 0;

        for (topic, handler) in &self.handlers {
            let claimed = {
                let mut conn = self.metadata.connection().await?;
                let Some(item) = queue.get_oldest_pending(&mut conn, Some(topic)).await? else {
                    continue;
                };
                match queue
                    .update_status(&mut conn, item.id, item.version, WorkQueueStatus::Doing)
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(MetadataError::NotFound(_)) => {
                        tracing::trace!(id = item.id, "work item claimed elsewhere");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            let status = self.execute(handler.as_ref(), &claimed).await;
            let mut conn = self.metadata.connection().await?;
            queue
                .update_status(&mut conn, claimed.id, claimed.version, status)
                .await?;
            ran += 1;
        }

        Ok(ran)
    }

    #[tracing::instrument(skip_all, fields(id = item.id, topic = %item.topic, attempt = item.times))]
    async fn execute(&self, handler: &dyn TaskHandler, item: &WorkQueueRow) -> WorkQueueStatus {
        match handler.handle(&item.payload).await {
            Ok(()) => {
                tracing::debug!("work item done");
                WorkQueueStatus::Success
            }
            Err(error) => {
                tracing::warn!(error = %error, "work item failed");
                WorkQueueStatus::Failed
            }
        }
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let idle = match self.run_once().await {
                Ok(ran) => ran == 0,
                Err(error) => {
                    tracing::warn!(%error, "work queue poll failed");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::debug!("work consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<ArtifactPushed>>,
    }

    #[async_trait::async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, payload: &str) -> eyre::Result<()> {
            let task: ArtifactPushed = serde_json::from_str(payload)?;
            if task.media_type.is_empty() {
                eyre::bail!("no media type");
            }
            self.seen.lock().unwrap().push(task);
            Ok(())
        }
    }

    fn task(digest: &str, media_type: &str) -> ArtifactPushed {
        ArtifactPushed {
            repository: "lib/app".into(),
            digest: digest.into(),
            media_type: media_type.into(),
        }
    }

    #[tokio::test]
    async fn consumer_runs_and_records_outcome() {
        let store = MetadataStore::in_memory().await.unwrap();
        let producer = Producer::new(store.clone());
        let ok = producer
            .enqueue(ARTIFACT_PUSHED, &task("sha256:aa", "application/json"))
            .await
            .unwrap();
        let bad = producer
            .enqueue(ARTIFACT_PUSHED, &task("sha256:bb", ""))
            .await
            .unwrap();
        producer.enqueue("other.topic", &"ignored").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let consumer = Consumer::new(store.clone()).register(ARTIFACT_PUSHED, recorder.clone());

        assert_eq!(consumer.run_once().await.unwrap(), 1);
        assert_eq!(consumer.run_once().await.unwrap(), 1);
        assert_eq!(consumer.run_once().await.unwrap(), 0);

        assert_eq!(recorder.seen.lock().unwrap().as_slice(), [task("sha256:aa", "application/json")]);

        let mut conn = store.connection().await.unwrap();
        let queue = store.work_queue();
        let ok = queue.get(&mut conn, ok).await.unwrap();
        assert_eq!(ok.status, WorkQueueStatus::Success);
        assert_eq!(ok.times, 1);
        assert_eq!(ok.version, 2);
        let bad = queue.get(&mut conn, bad).await.unwrap();
        assert_eq!(bad.status, WorkQueueStatus::Failed);

        // unregistered topics stay pending
        let pending = queue.get_oldest_pending(&mut conn, None).await.unwrap().unwrap();
        assert_eq!(pending.topic, "other.topic");
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = MetadataStore::in_memory().await.unwrap();
        let consumer = Consumer::new(store).poll_interval(Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap();
    }
}
