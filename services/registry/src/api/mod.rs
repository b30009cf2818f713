//! API server builder and request dispatch
//!
//! Requests are offered to an ordered list of [`RouteFactory`] values. Each
//! one either handles the request, hands it back with [`Dispatch::Next`], or
//! fails with a [`RegistryError`] rendered as the OCI error envelope.

use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use storage::StorageBucket;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::auth::{Action, AllowAll, Authorizer, Subject};
use crate::config::{HttpConfig, RegistryConfig};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::ManifestService;
use crate::metadata::MetadataStore;
use crate::reference::RepositoryName;
use crate::upload::UploadManager;

mod blobs;
mod catalog;
mod manifests;
mod referrers;
mod route;
mod tags;
mod uploads;

/// What a route factory did with a request.
pub enum Dispatch {
    /// The request was answered.
    Handled(Response),
    /// Not this factory's request; offer it to the next one.
    Next(Request),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Handled(response) => f.debug_tuple("Handled").field(&response.status()).finish(),
            Dispatch::Next(request) => f.debug_tuple("Next").field(request.uri()).finish(),
        }
    }
}

/// One entry in the dispatch chain.
#[async_trait::async_trait]
pub trait RouteFactory: fmt::Debug + Send + Sync {
    /// Answer `request`, or hand it back to continue down the chain.
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch>;
}

static_assertions::assert_obj_safe!(RouteFactory);

/// Errors from [`RegistryBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("storage backend must be configured")]
    MissingStorage,

    #[error("metadata store must be configured")]
    MissingMetadata,
}

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    metadata: Option<MetadataStore>,
    authorizer: Option<Arc<dyn Authorizer>>,
    routes: Vec<Arc<dyn RouteFactory>>,
    config: RegistryConfig,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage, overriding the configured one
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the metadata store
    pub fn metadata(mut self, metadata: MetadataStore) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the authorizer; everything is allowed by default
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Offer requests to `route` before the distribution routes
    pub fn route(mut self, route: Arc<dyn RouteFactory>) -> Self {
        self.routes.push(route);
        self
    }

    /// Set the service configuration
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the registry service
    pub fn build(self) -> Result<Registry, BuildError> {
        let storage = self.storage.ok_or(BuildError::MissingStorage)?;
        let config = self.config;
        let metadata = self
            .metadata
            .ok_or(BuildError::MissingMetadata)?
            .with_retry((&config.retry).into());
        let bucket = self.bucket.unwrap_or_else(|| config.bucket.clone());

        let storage = storage.with_retry((&config.retry).into());
        let blobs = storage.bucket(bucket);
        let uploads =
            UploadManager::new(blobs.clone(), metadata.clone()).with_max_chunk(config.upload.max_chunk);
        let manifests = ManifestService::new(
            metadata.clone(),
            config.namespace.clone(),
            config.http.manifest_max_bytes,
        );

        let mut routes = self.routes;
        routes.extend(default_routes());

        Ok(Registry {
            inner: Arc::new(Inner {
                blobs,
                metadata,
                uploads,
                manifests,
                authorizer: self.authorizer.unwrap_or_else(|| Arc::new(AllowAll)),
                http: config.http,
                routes,
            }),
        })
    }
}

fn default_routes() -> Vec<Arc<dyn RouteFactory>> {
    vec![
        Arc::new(VersionCheck),
        Arc::new(catalog::Catalog),
        Arc::new(tags::TagList),
        Arc::new(uploads::Uploads),
        Arc::new(blobs::Blobs),
        Arc::new(manifests::Manifests),
        Arc::new(referrers::Referrers),
        Arc::new(Unsupported),
    ]
}

/// A configured registry: its components and the dispatch chain.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    blobs: StorageBucket,
    metadata: MetadataStore,
    uploads: UploadManager,
    manifests: ManifestService,
    authorizer: Arc<dyn Authorizer>,
    http: HttpConfig,
    routes: Vec<Arc<dyn RouteFactory>>,
}

impl Registry {
    /// The HTTP service, ready for any tower-compatible server
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.clone())
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("docker-distribution-api-version"),
                HeaderValue::from_static("registry/2.0"),
            ))
    }

    /// The bucket holding blob objects.
    pub fn blobs(&self) -> &StorageBucket {
        &self.inner.blobs
    }

    /// The metadata store.
    pub fn metadata(&self) -> &MetadataStore {
        &self.inner.metadata
    }

    /// Blob upload sessions.
    pub fn uploads(&self) -> &UploadManager {
        &self.inner.uploads
    }

    /// Manifest ingest and lookup.
    pub fn manifests(&self) -> &ManifestService {
        &self.inner.manifests
    }

    /// HTTP settings: timeouts, page sizes and the manifest size cap.
    pub fn http(&self) -> &HttpConfig {
        &self.inner.http
    }

    /// Check `action` on `repository` for `subject`.
    pub async fn authorize(
        &self,
        subject: &Subject,
        repository: &RepositoryName,
        action: Action,
    ) -> RegistryResult<()> {
        self.inner
            .authorizer
            .authorize(subject, repository, action)
            .await
    }

    async fn dispatch(&self, mut request: Request) -> Response {
        for route in &self.inner.routes {
            match route.serve(self, request).await {
                Ok(Dispatch::Handled(response)) => return response,
                Ok(Dispatch::Next(next)) => request = next,
                Err(err) => return err.into_response(),
            }
        }
        RegistryError::MethodNotAllowed.into_response()
    }
}

/// Blob upload bodies may take arbitrarily long, so they run without the
/// request timeout.
fn is_upload(request: &Request) -> bool {
    request.uri().path().contains("/blobs/uploads/")
}

#[tracing::instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn dispatch(State(registry): State<Registry>, request: Request) -> Response {
    if is_upload(&request) {
        return registry.dispatch(request).await;
    }

    let limit = registry.http().request_timeout();
    match tokio::time::timeout(limit, registry.dispatch(request)).await {
        Ok(response) => response,
        Err(_) => RegistryError::Timeout(limit).into_response(),
    }
}

/// `GET /v2/`: the API version check.
#[derive(Debug)]
struct VersionCheck;

#[async_trait::async_trait]
impl RouteFactory for VersionCheck {
    async fn serve(&self, _: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let path = request.uri().path();
        if !(path == "/v2/" || path == "/v2") || request.method() != Method::GET {
            return Ok(Dispatch::Next(request));
        }
        Ok(Dispatch::Handled(
            (StatusCode::OK, Json(json!({}))).into_response(),
        ))
    }
}

/// The end of the chain: nothing else wanted the request.
#[derive(Debug)]
struct Unsupported;

#[async_trait::async_trait]
impl RouteFactory for Unsupported {
    async fn serve(&self, _: &Registry, _: Request) -> RegistryResult<Dispatch> {
        Err(RegistryError::MethodNotAllowed)
    }
}
