//! `GET /v2/<name>/tags/list`

use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use super::route::{self, Page};
use super::{Dispatch, Registry, RouteFactory};
use crate::auth::Action;
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug)]
pub(super) struct TagList;

#[async_trait::async_trait]
impl RouteFactory for TagList {
    async fn serve(&self, registry: &Registry, request: Request) -> RegistryResult<Dispatch> {
        let name = match route::split(request.uri().path(), "/tags/list") {
            Some(Ok((name, tail))) if tail.is_empty() && request.method() == Method::GET => name,
            Some(Err(err)) => return Err(err),
            _ => return Ok(Dispatch::Next(request)),
        };
        let page = Page::from_query(request.uri().query(), registry.http())?;
        let subject = route::subject(&request);
        drop(request);

        registry.authorize(&subject, &name, Action::Pull).await?;

        let mut tags: Vec<String> = {
            let metadata = registry.metadata();
            let mut conn = metadata.connection().await?;
            let repository = metadata
                .repositories()
                .get_by_name(&mut conn, name.as_str())
                .await?
                .ok_or_else(|| RegistryError::NameUnknown(name.to_string()))?;
            metadata
                .tags()
                .list(&mut conn, repository.id, &page.lookahead())
                .await?
                .into_iter()
                .map(|tag| tag.name)
                .collect()
        };
        let link = page.finish(&format!("/v2/{name}/tags/list"), &mut tags);

        let mut response =
            (StatusCode::OK, Json(json!({ "name": name.as_str(), "tags": tags }))).into_response();
        if let Some(link) = link.and_then(|link| link.parse().ok()) {
            response.headers_mut().insert(header::LINK, link);
        }
        Ok(Dispatch::Handled(response))
    }
}
