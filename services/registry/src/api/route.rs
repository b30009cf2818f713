//! Path matching, pagination and header helpers shared by the route factories.

use std::io;

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderName;
use axum::http::header::AsHeaderName;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::auth::Subject;
use crate::config::HttpConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::models::Pagination;
use crate::reference::RepositoryName;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
pub(crate) const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");
pub(crate) const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

/// The caller attached by upstream authentication, or anonymous.
pub(crate) fn subject(request: &Request) -> Subject {
    request
        .extensions()
        .get::<Subject>()
        .cloned()
        .unwrap_or_default()
}

/// An owned header value, if present and printable.
pub(crate) fn header(request: &Request, name: impl AsHeaderName) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Split `/v2/<name><marker><tail>` into a validated name and the tail.
///
/// The last occurrence of `marker` wins, and the tail must be a single path
/// segment (possibly empty), so repository names may contain the marker's
/// words as components.
pub(crate) fn split(path: &str, marker: &str) -> Option<RegistryResult<(RepositoryName, String)>> {
    let rest = path.strip_prefix("/v2/")?;
    let (name, tail) = rest.rsplit_once(marker)?;
    if name.is_empty() || tail.contains('/') {
        return None;
    }
    Some(RepositoryName::parse(name).map(|name| (name, tail.to_owned())))
}

/// A requested page after clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Page {
    pub(crate) limit: u32,
    pub(crate) last: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    n: Option<String>,
    last: Option<String>,
}

impl Page {
    /// Read `n` and `last` from a query string.
    pub(crate) fn from_query(query: Option<&str>, http: &HttpConfig) -> RegistryResult<Self> {
        let query: PageQuery = serde_urlencoded::from_str(query.unwrap_or_default())
            .map_err(|err| RegistryError::PaginationNumberInvalid(err.to_string()))?;

        let limit = match query.n.as_deref() {
            None | Some("") => http.page_size,
            Some(n) => n
                .parse::<u32>()
                .map_err(|_| RegistryError::PaginationNumberInvalid(n.to_owned()))?,
        };

        Ok(Self {
            limit: limit.min(http.max_page_size),
            last: query.last.filter(|last| !last.is_empty()),
        })
    }

    /// One more row than the page holds, to learn whether another page follows.
    pub(crate) fn lookahead(&self) -> Pagination {
        Pagination::new(self.limit.saturating_add(1), self.last.clone())
    }

    /// Trim a lookahead result to the page, returning the `Link` header value
    /// when more rows exist.
    pub(crate) fn finish(&self, path: &str, items: &mut Vec<String>) -> Option<String> {
        if self.limit == 0 {
            items.clear();
            return None;
        }
        if items.len() <= self.limit as usize {
            return None;
        }
        items.truncate(self.limit as usize);
        let last = items.last()?;
        let query = serde_urlencoded::to_string([("n", self.limit.to_string()), ("last", last.clone())]).ok()?;
        Some(format!("<{path}?{query}>; rel=\"next\""))
    }
}

/// Stream a request body as `AsyncRead`.
pub(crate) fn body_reader(body: Body) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// A byte range requested with `Range: bytes=<start>-[<end>]`, resolved
/// against the object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl ByteRange {
    pub(crate) fn parse(value: &str, size: u64) -> RegistryResult<Self> {
        let unsatisfiable = || RegistryError::RangeNotSatisfiable(format!("{value} of {size} bytes"));
        let spec = value.trim().strip_prefix("bytes=").ok_or_else(unsatisfiable)?;
        let (start, end) = spec.split_once('-').ok_or_else(unsatisfiable)?;

        let (start, end) = match (start.trim(), end.trim()) {
            // suffix: the last N bytes
            ("", suffix) => {
                let suffix: u64 = suffix.parse().map_err(|_| unsatisfiable())?;
                if suffix == 0 {
                    return Err(unsatisfiable());
                }
                (size.saturating_sub(suffix), size.saturating_sub(1))
            }
            (start, "") => (start.parse().map_err(|_| unsatisfiable())?, size.saturating_sub(1)),
            (start, end) => {
                let start: u64 = start.parse().map_err(|_| unsatisfiable())?;
                let end: u64 = end.parse().map_err(|_| unsatisfiable())?;
                (start, end.min(size.saturating_sub(1)))
            }
        };

        if size == 0 || start >= size || end < start {
            return Err(unsatisfiable());
        }
        Ok(Self { start, end })
    }

    pub(crate) fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub(crate) fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}
