//! Database models mapping to the metadata schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Who may pull from a namespace or repository without being a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

// =============================================================================
// Namespaces and repositories
// =============================================================================

/// A `namespaces` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct NamespaceRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub repository_limit: i64,
    pub repository_count: i64,
    pub tag_limit: i64,
    pub tag_count: i64,
    pub size_limit: i64,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Quota limits; zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[allow(missing_docs)]
pub struct Limits {
    pub repository_limit: i64,
    pub tag_limit: i64,
    pub size_limit: i64,
}

/// Input to [`Namespaces::create`](super::Namespaces::create).
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewNamespace {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub limits: Limits,
}

/// The namespace columns which may be changed after creation.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct NamespaceUpdate {
    pub description: Option<Option<String>>,
    pub visibility: Option<Visibility>,
    pub repository_limit: Option<i64>,
    pub tag_limit: Option<i64>,
    pub size_limit: Option<i64>,
}

/// A `repositories` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct RepositoryRow {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub overview: Option<String>,
    pub visibility: Visibility,
    pub tag_limit: i64,
    pub tag_count: i64,
    pub size_limit: i64,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`Repositories::create`](super::Repositories::create).
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewRepository {
    pub namespace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
}

/// The repository columns which may be changed after creation.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct RepositoryUpdate {
    pub description: Option<Option<String>>,
    pub overview: Option<Option<String>>,
    pub visibility: Option<Visibility>,
    pub tag_limit: Option<i64>,
    pub size_limit: Option<i64>,
}

// =============================================================================
// Content
// =============================================================================

/// A `blobs` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct BlobRow {
    pub id: i64,
    pub digest: String,
    pub size: i64,
    pub content_type: String,
    pub pull_count: i64,
    pub last_pull: Option<DateTime<Utc>>,
    pub pushed_at: DateTime<Utc>,
}

/// An `artifacts` row; the manifest bytes are kept inline.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct ArtifactRow {
    pub id: i64,
    pub repository_id: i64,
    pub digest: String,
    pub media_type: String,
    pub artifact_type: Option<String>,
    pub config_media_type: Option<String>,
    pub subject_digest: Option<String>,
    pub raw: Vec<u8>,
    pub size: i64,
    pub pull_count: i64,
    pub last_pull: Option<DateTime<Utc>>,
    pub pushed_at: DateTime<Utc>,
}

/// Input to [`Artifacts::create`](super::Artifacts::create).
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewArtifact {
    pub repository_id: i64,
    pub digest: String,
    pub media_type: String,
    pub artifact_type: Option<String>,
    pub config_media_type: Option<String>,
    pub subject_digest: Option<String>,
    pub raw: Vec<u8>,
    pub size: i64,
}

/// Scan status shared by SBOM and vulnerability records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ScanStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// An `artifact_sboms` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct ArtifactSbomRow {
    pub id: i64,
    pub artifact_id: i64,
    pub raw: Option<Vec<u8>>,
    pub result: Option<String>,
    pub status: ScanStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An `artifact_vulnerabilities` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct ArtifactVulnerabilityRow {
    pub id: i64,
    pub artifact_id: i64,
    pub metadata: Option<String>,
    pub raw: Option<Vec<u8>>,
    pub result: Option<String>,
    pub status: ScanStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A scan record to store next to an artifact.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct ScanRecord {
    pub raw: Option<Vec<u8>>,
    pub result: Option<String>,
    pub status: ScanStatus,
    pub message: Option<String>,
}

/// A `tags` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct TagRow {
    pub id: i64,
    pub repository_id: i64,
    pub artifact_id: i64,
    pub name: String,
    pub pull_count: i64,
    pub last_pull: Option<DateTime<Utc>>,
    pub pushed_at: DateTime<Utc>,
}

// =============================================================================
// Uploads
// =============================================================================

/// One row of a blob upload session.
///
/// Part 0 anchors the session (repository and backend upload id, no data);
/// chunk parts are numbered from 1.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct BlobUploadRow {
    pub id: i64,
    pub upload_id: String,
    pub part_number: i64,
    pub repository: String,
    pub file_id: String,
    pub etag: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`BlobUploads::create`](super::BlobUploads::create).
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewBlobUploadPart {
    pub upload_id: String,
    pub part_number: i64,
    pub repository: String,
    pub file_id: String,
    pub etag: String,
    pub size: i64,
}

// =============================================================================
// Work queue
// =============================================================================

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum WorkQueueStatus {
    Pending,
    Doing,
    Success,
    Failed,
}

/// A `work_queue` row.
#[derive(Debug, Clone, FromRow)]
#[allow(missing_docs)]
pub struct WorkQueueRow {
    pub id: i64,
    pub topic: String,
    pub payload: String,
    pub status: WorkQueueStatus,
    pub version: i64,
    pub times: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Paging
// =============================================================================

/// Scroll pagination by name: at most `limit` rows strictly after `last`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    /// Largest number of rows to return.
    pub limit: u32,
    /// Name of the last row already seen.
    pub last: Option<String>,
}

impl Pagination {
    /// A page of at most `limit` rows after `last`.
    pub fn new(limit: u32, last: Option<String>) -> Self {
        Self { limit, last }
    }
}
