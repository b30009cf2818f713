//! `GET`/`HEAD /v2/<name>/blobs/<digest>`

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::IntoResponse;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use super::route::{self, ByteRange, DOCKER_CONTENT_DIGEST};
use super::{Dispatch, Registry, RouteFactory};
use crate::auth::Action;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::models::BlobRow;

#[derive(Debug)]
pub(super) struct Blobs;

#[async_trait::async_trait]
impl RouteFactory for Blobs {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let head = request.method() == Method::HEAD;
        if !head && request.method() != Method::GET {
            return Ok(Dispatch::Next(request));
        }
        let (name, digest) = match route::split(request.uri().path(), "/blobs/") {
            Some(Ok(found)) => found,
            Some(Err(err)) => return Err(err),
            None => return Ok(Dispatch::Next(request)),
        };
        let digest: Digest = digest.parse()?;
        let range = route::header(&request, header::RANGE);
        let subject = route::subject(&request);
        drop(request);

        registry.authorize(&subject, &name, Action::Pull).await?;

        let blob = {
            let metadata = registry.metadata();
            let mut conn = metadata.connection().await?;
            metadata
                .blobs()
                .find_by_digest(&mut conn, &digest.to_string())
                .await?
                .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?
        };
        let size = u64::try_from(blob.size).unwrap_or_default();

        if head {
            return Ok(Dispatch::Handled(
                (StatusCode::OK, headers(&blob, size)).into_response(),
            ));
        }

        let range = range
            .map(|value| ByteRange::parse(&value, size))
            .transpose()?;
        let offset = range.map(|range| range.start).unwrap_or_default();
        let reader = registry
            .blobs()
            .reader(&digest.blob_path(), offset)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    RegistryError::BlobUnknown(digest.to_string())
                } else {
                    err.into()
                }
            })?;
        record_pull(registry, blob.id);

        let response = match range {
            Some(range) => {
                let body = Body::from_stream(ReaderStream::new(reader.take(range.len())));
                let mut response =
                    (StatusCode::PARTIAL_CONTENT, headers(&blob, range.len()), body).into_response();
                if let Ok(value) = range.content_range(size).parse() {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                response
            }
            None => {
                let body = Body::from_stream(ReaderStream::new(reader));
                (StatusCode::OK, headers(&blob, size), body).into_response()
            }
        };
        Ok(Dispatch::Handled(response))
    }
}

fn headers(blob: &BlobRow, length: u64) -> [(HeaderName, String); 4] {
    [
        (header::CONTENT_LENGTH, length.to_string()),
        (header::CONTENT_TYPE, blob.content_type.clone()),
        (DOCKER_CONTENT_DIGEST, blob.digest.clone()),
        (header::ACCEPT_RANGES, "bytes".to_owned()),
    ]
}

fn record_pull(registry: &Registry, id: i64) {
    let metadata = registry.metadata().clone();
    tokio::spawn(async move {
        let result = async {
            let mut conn = metadata.connection().await?;
            metadata.blobs().incr_pull(&mut conn, id).await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!(%error, blob = id, "failed to record blob pull");
        }
    });
}
