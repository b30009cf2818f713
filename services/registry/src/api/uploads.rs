//! `/v2/<name>/blobs/uploads/`: upload sessions, monolithic pushes and
//! cross-repository mounts.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::route::{self, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use super::{Dispatch, Registry, RouteFactory};
use crate::auth::{Action, Subject};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::reference::RepositoryName;
use crate::upload::{ChunkRange, UploadStatus};

#[derive(Debug)]
pub(super) struct Uploads;

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

impl UploadQuery {
    fn digest(&self) -> RegistryResult<Option<Digest>> {
        self.digest
            .as_deref()
            .map(str::parse::<Digest>)
            .transpose()
            .map_err(RegistryError::from)
    }
}

#[async_trait::async_trait]
impl RouteFactory for Uploads {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let (name, id) = match route::split(request.uri().path(), "/blobs/uploads/") {
            Some(Ok(found)) => found,
            Some(Err(err)) => return Err(err),
            None => return Ok(Dispatch::Next(request)),
        };

        let query: UploadQuery = serde_urlencoded::from_str(request.uri().query().unwrap_or_default())
            .map_err(|err| RegistryError::BlobUploadInvalid(err.to_string()))?;
        let subject = route::subject(&request);
        let method = request.method().clone();

        let response = match (method, id.is_empty()) {
            (Method::POST, true) => start(registry, &subject, &name, query, request.into_body()).await?,
            (Method::GET, false) => {
                registry.authorize(&subject, &name, Action::Push).await?;
                let status = registry.uploads().status(&name, &id).await?;
                progress(StatusCode::NO_CONTENT, &status)
            }
            (Method::PATCH, false) => {
                let range = route::header(&request, header::CONTENT_RANGE)
                    .map(|value| ChunkRange::parse(&value))
                    .transpose()?;
                registry.authorize(&subject, &name, Action::Push).await?;
                let status = registry
                    .uploads()
                    .append(&name, &id, range, route::body_reader(request.into_body()))
                    .await?;
                progress(StatusCode::ACCEPTED, &status)
            }
            (Method::PUT, false) => {
                let digest = query.digest()?.ok_or_else(|| {
                    RegistryError::DigestInvalid("digest query parameter is required".into())
                })?;
                let empty = route::header(&request, header::CONTENT_LENGTH).as_deref() == Some("0");
                registry.authorize(&subject, &name, Action::Push).await?;
                let body = (!empty).then(|| route::body_reader(request.into_body()));
                let blob = registry.uploads().finish(&name, &id, &digest, body).await?;
                created(&name, &blob.digest)
            }
            (Method::DELETE, false) => {
                registry.authorize(&subject, &name, Action::Push).await?;
                registry.uploads().abort(&name, &id).await?;
                StatusCode::NO_CONTENT.into_response()
            }
            _ => return Ok(Dispatch::Next(request)),
        };
        Ok(Dispatch::Handled(response))
    }
}

/// `POST`: mount an existing blob, accept a whole blob, or open a session.
#[tracing::instrument(skip(registry, subject, body), fields(%name))]
async fn start(
    registry: &Registry,
    subject: &Subject,
    name: &RepositoryName,
    query: UploadQuery,
    body: Body,
) -> RegistryResult<Response> {
    registry.authorize(subject, name, Action::Push).await?;

    if let Some(mount) = query.mount.as_deref() {
        let digest: Digest = mount.parse()?;
        if let Some(from) = query.from.as_deref() {
            let from = RepositoryName::parse(from)?;
            registry.authorize(subject, &from, Action::Pull).await?;
        }
        if let Some(blob) = registry.uploads().mount(&digest).await? {
            tracing::debug!(%digest, "blob mounted");
            return Ok(created(name, &blob.digest));
        }
        tracing::debug!(%digest, "mount source missing, opening a session instead");
    } else if let Some(digest) = query.digest()? {
        let blob = registry
            .uploads()
            .upload_monolithic(name, &digest, route::body_reader(body))
            .await?;
        return Ok(created(name, &blob.digest));
    }

    let status = registry.uploads().initiate(name).await?;
    Ok(progress(StatusCode::ACCEPTED, &status))
}

fn progress(status: StatusCode, upload: &UploadStatus) -> Response {
    let headers: [(HeaderName, String); 4] = [
        (header::LOCATION, upload.location()),
        (header::RANGE, upload.range()),
        (DOCKER_UPLOAD_UUID, upload.id.clone()),
        (header::CONTENT_LENGTH, "0".to_owned()),
    ];
    (status, headers).into_response()
}

fn created(name: &RepositoryName, digest: &str) -> Response {
    let headers: [(HeaderName, String); 3] = [
        (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
        (DOCKER_CONTENT_DIGEST, digest.to_owned()),
        (header::CONTENT_LENGTH, "0".to_owned()),
    ];
    (StatusCode::CREATED, headers).into_response()
}
