//! Registry configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration which serves from memory on `127.0.0.1:5000`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use storage::{Backoff, StorageConfig};

use crate::metadata::models::Limits;

/// Top-level configuration for the registry service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Address the server binds to.
    pub listen: SocketAddr,

    /// Which storage driver holds blobs.
    pub storage: StorageConfig,

    /// Bucket within the storage driver.
    pub bucket: String,

    /// Where namespaces, repositories and upload sessions are recorded.
    pub database: DatabaseConfig,
    /// Upload sessions.
    pub upload: UploadConfig,
    /// Named locks.
    pub locker: LockerConfig,
    /// The HTTP surface.
    pub http: HttpConfig,
    /// First-push provisioning.
    pub namespace: NamespaceConfig,
    /// Retries of transient storage and metadata failures.
    pub retry: RetryConfig,
    /// Blob collection.
    pub gc: GcConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            storage: StorageConfig::default(),
            bucket: "registry".into(),
            database: DatabaseConfig::default(),
            upload: UploadConfig::default(),
            locker: LockerConfig::default(),
            http: HttpConfig::default(),
            namespace: NamespaceConfig::default(),
            retry: RetryConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

/// SQLite connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DatabaseConfig {
    /// `sqlite::memory:` or `sqlite://path/to/registry.db`.
    pub url: String,
    /// Pool size; in-memory databases always use one connection.
    pub max_connections: u32,

    /// How long SQLite waits on a locked database before reporting it busy.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            busy_timeout_ms: 5000,
        }
    }
}

/// Blob upload session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UploadConfig {
    /// Seconds of inactivity before a session is swept.
    pub session_ttl: u64,

    /// Seconds between sweeps.
    pub sweep_interval: u64,

    /// Largest accepted PATCH body, in bytes.
    pub max_chunk: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl: 24 * 60 * 60,
            sweep_interval: 600,
            max_chunk: None,
        }
    }
}

impl UploadConfig {
    /// [`UploadConfig::session_ttl`] as a duration.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }

    /// [`UploadConfig::sweep_interval`] as a duration, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

/// Named lock retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LockerConfig {
    /// Attempts before a held lock is reported as a conflict.
    pub attempts: u32,
    /// Milliseconds between attempts.
    pub backoff_ms: u64,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            attempts: 6,
            backoff_ms: 1000,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpConfig {
    /// Seconds before a request is abandoned; blob upload bodies are exempt.
    pub request_timeout: u64,

    /// Page size used when `n` is absent.
    pub page_size: u32,

    /// Largest page a client may ask for.
    pub max_page_size: u32,

    /// Largest accepted manifest body, in bytes.
    pub manifest_max_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: 60,
            page_size: 100,
            max_page_size: 1000,
            manifest_max_bytes: 4 * 1024 * 1024,
        }
    }
}

impl HttpConfig {
    /// [`HttpConfig::request_timeout`] as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Namespace provisioning on first push.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NamespaceConfig {
    /// Create missing namespaces and repositories when content is pushed.
    pub auto_create: bool,

    /// Limits given to auto-created namespaces.
    #[serde(flatten)]
    pub limits: Limits,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            limits: Limits::default(),
        }
    }
}

/// Retry policy for transient storage and metadata failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    /// First delay, in milliseconds.
    pub initial_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub factor: u32,
    /// Retries stop once the delay would reach this many milliseconds.
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            factor: 2,
            max_ms: 5000,
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.initial_ms),
            config.factor,
            Duration::from_millis(config.max_ms),
        )
    }
}

/// Collection of blobs which no artifact references.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GcConfig {
    /// Run the blob collector alongside the upload sweeper.
    pub collect_blobs: bool,

    /// Seconds an unreferenced blob is kept after its last push or pull.
    pub blob_grace: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            collect_blobs: false,
            blob_grace: 7 * 24 * 60 * 60,
        }
    }
}

impl GcConfig {
    /// [`GcConfig::blob_grace`] as a duration.
    pub fn blob_grace(&self) -> Duration {
        Duration::from_secs(self.blob_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.locker.attempts, 6);
        assert_eq!(config.upload.session_ttl(), Duration::from_secs(86400));
        assert!(config.namespace.auto_create);
        assert_eq!(config.http.page_size, 100);
        assert!(!config.gc.collect_blobs);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RegistryConfig = serde_json::from_value(serde_json::json!({
            "bucket": "images",
            "namespace": { "auto-create": false, "tag-limit": 10 },
            "http": { "max-page-size": 50 },
        }))
        .unwrap();
        assert_eq!(config.bucket, "images");
        assert!(!config.namespace.auto_create);
        assert_eq!(config.namespace.limits.tag_limit, 10);
        assert_eq!(config.http.max_page_size, 50);
        assert_eq!(config.http.page_size, 100);
    }

    #[test]
    fn retry_config_builds_backoff() {
        let backoff = Backoff::from(&RetryConfig::default());
        assert_eq!(backoff.delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(5));
    }
}
