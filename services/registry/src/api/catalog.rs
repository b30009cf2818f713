//! `GET /v2/_catalog`

use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use super::route::Page;
use super::{Dispatch, Registry, RouteFactory};
use crate::error::RegistryResult;

#[derive(Debug)]
pub(super) struct Catalog;

#[async_trait::async_trait]
impl RouteFactory for Catalog {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        if request.uri().path() != "/v2/_catalog" || request.method() != Method::GET {
            return Ok(Dispatch::Next(request));
        }

        let page = Page::from_query(request.uri().query(), registry.http())?;
        let mut names: Vec<String> = {
            let metadata = registry.metadata();
            let mut conn = metadata.connection().await?;
            metadata
                .repositories()
                .list(&mut conn, None, &page.lookahead())
                .await?
                .into_iter()
                .map(|repository| repository.name)
                .collect()
        };
        let link = page.finish("/v2/_catalog", &mut names);

        let mut response = (StatusCode::OK, Json(json!({ "repositories": names }))).into_response();
        if let Some(link) = link.and_then(|link| link.parse().ok()) {
            response.headers_mut().insert(header::LINK, link);
        }
        Ok(Dispatch::Handled(response))
    }
}
