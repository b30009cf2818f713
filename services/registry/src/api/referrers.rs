//! `GET /v2/<name>/referrers/<digest>`

use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Json};

use super::route::{self, OCI_FILTERS_APPLIED};
use super::{Dispatch, Registry, RouteFactory};
use crate::auth::Action;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::manifest::OCI_IMAGE_INDEX;

#[derive(Debug)]
pub(super) struct Referrers;

#[async_trait::async_trait]
impl RouteFactory for Referrers {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let (name, subject_digest) = match route::split(request.uri().path(), "/referrers/") {
            Some(Ok(found)) if request.method() == Method::GET => found,
            Some(Err(err)) => return Err(err),
            _ => return Ok(Dispatch::Next(request)),
        };
        let subject_digest: Digest = subject_digest.parse()?;
        let filters = artifact_types(request.uri().query());
        let subject = route::subject(&request);
        drop(request);

        registry.authorize(&subject, &name, Action::Pull).await?;
        let index = registry
            .manifests()
            .referrers(&name, &subject_digest, &filters)
            .await?;

        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OCI_IMAGE_INDEX)],
            Json(index),
        )
            .into_response();
        if !filters.is_empty() {
            if let Ok(value) = filters.join(",").parse() {
                response.headers_mut().insert(OCI_FILTERS_APPLIED, value);
            }
        }
        Ok(Dispatch::Handled(response))
    }
}

/// Every `artifactType` value, repeated or comma-separated.
///
/// Filtering is optional for registries, so a query that cannot be decoded
/// is served unfiltered (and without `OCI-Filters-Applied`).
fn artifact_types(query: Option<&str>) -> Vec<String> {
    let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(query.unwrap_or_default()) {
        Ok(pairs) => pairs,
        Err(error) => {
            tracing::debug!(%error, ?query, "ignoring undecodable referrers query");
            return Vec::new();
        }
    };
    pairs
        .into_iter()
        .filter(|(key, _)| key == "artifactType")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_split_on_commas() {
        assert_eq!(
            artifact_types(Some("artifactType=a%2Fb,c&artifactType=d&n=1")),
            ["a/b", "c", "d"]
        );
        assert!(artifact_types(None).is_empty());
        assert!(artifact_types(Some("artifactType=&artifactType=,")).is_empty());
    }
}
