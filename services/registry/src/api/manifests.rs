//! `/v2/<name>/manifests/<reference>`

use std::error::Error as _;

use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::IntoResponse;
use http_body_util::LengthLimitError;

use super::route::{self, DOCKER_CONTENT_DIGEST, OCI_SUBJECT};
use super::{Dispatch, Registry, RouteFactory};
use crate::auth::Action;
use crate::error::{RegistryError, RegistryResult};
use crate::reference::Reference;

#[derive(Debug)]
pub(super) struct Manifests;

#[async_trait::async_trait]
impl RouteFactory for Manifests {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let (name, reference) = match route::split(request.uri().path(), "/manifests/") {
            Some(Ok((name, reference))) if !reference.is_empty() => (name, reference),
            Some(Err(err)) => return Err(err),
            _ => return Ok(Dispatch::Next(request)),
        };
        let method = request.method().clone();
        let action = match method {
            Method::GET | Method::HEAD => Action::Pull,
            Method::PUT => Action::Push,
            Method::DELETE => Action::Delete,
            _ => return Ok(Dispatch::Next(request)),
        };
        let reference = Reference::parse(&reference)?;
        let subject = route::subject(&request);
        registry.authorize(&subject, &name, action).await?;

        let manifests = registry.manifests();
        let response = match method {
            Method::PUT => {
                let content_type = route::header(&request, header::CONTENT_TYPE);
                let limit = registry.http().manifest_max_bytes;
                let body = axum::body::to_bytes(request.into_body(), limit)
                    .await
                    .map_err(|err| {
                        let too_large = err
                            .source()
                            .is_some_and(|source| source.is::<LengthLimitError>());
                        if too_large {
                            RegistryError::ManifestTooLarge { limit }
                        } else {
                            RegistryError::ManifestInvalid(err.to_string())
                        }
                    })?;

                let pushed = manifests
                    .put(&name, &reference, content_type.as_deref(), body)
                    .await?;
                let mut headers = vec![
                    (header::LOCATION, format!("/v2/{name}/manifests/{}", pushed.digest)),
                    (DOCKER_CONTENT_DIGEST, pushed.digest.to_string()),
                    (header::CONTENT_LENGTH, "0".to_owned()),
                ];
                if let Some(subject) = &pushed.subject {
                    headers.push((OCI_SUBJECT, subject.to_string()));
                }
                let mut response = StatusCode::CREATED.into_response();
                extend(&mut response, headers);
                response
            }
            Method::DELETE => {
                manifests.delete(&name, &reference).await?;
                StatusCode::ACCEPTED.into_response()
            }
            _ => {
                let head = method == Method::HEAD;
                let stored = manifests.get(&name, &reference, !head).await?;
                let headers: [(HeaderName, String); 3] = [
                    (header::CONTENT_TYPE, stored.media_type),
                    (DOCKER_CONTENT_DIGEST, stored.digest.to_string()),
                    (header::CONTENT_LENGTH, stored.raw.len().to_string()),
                ];
                if head {
                    (StatusCode::OK, headers).into_response()
                } else {
                    (StatusCode::OK, headers, stored.raw).into_response()
                }
            }
        };
        Ok(Dispatch::Handled(response))
    }
}

fn extend(response: &mut axum::response::Response, headers: Vec<(HeaderName, String)>) {
    for (name, value) in headers {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
}
