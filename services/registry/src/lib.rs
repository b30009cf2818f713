//! # OCI Container Registry
//!
//! The data plane of an OCI registry following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec):
//! content-addressed blobs on pluggable object storage, resumable upload
//! sessions, manifest ingest with tag binding and referrer indexing, and the
//! `/v2/` HTTP surface over all of it.
//!
//! ## Features
//!
//! - Monolithic, chunked and cross-repository mounted blob uploads
//! - OCI image manifests and indexes, Docker v2 manifests, OCI artifacts and Helm charts
//! - Referrers API with `artifactType` filtering
//! - Namespace quotas enforced inside the ingest transaction
//! - SQLite metadata through `sqlx`, storage through the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use registry::metadata::MetadataStore;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .metadata(MetadataStore::in_memory().await?)
//!     .build()?;
//!
//! // Use the router with axum or any tower-compatible server
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry.router()).await?;
//! # Ok(())
//! # }
//! ```

mod api;
/// Who is asking, and whether they may.
pub mod auth;
/// Service configuration.
pub mod config;
mod digest;
mod error;
/// Background cleanup.
pub mod gc;
/// Manifest ingest and lookup.
pub mod manifest;
/// Transactional metadata.
pub mod metadata;
mod reference;
/// Blob upload sessions.
pub mod upload;
/// The background work queue.
pub mod work;

pub use api::{BuildError, Dispatch, Registry, RegistryBuilder, RouteFactory};
pub use config::RegistryConfig;
pub use digest::{Digest, DigestError};
pub use error::{RegistryError, RegistryResult};
pub use reference::{Reference, RepositoryName, is_valid_tag};
