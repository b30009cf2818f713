//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use storage::{StorageError, StorageErrorKind};

use crate::digest::DigestError;
use crate::metadata::{MetadataError, Transient};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
///
/// Each variant carries exactly one OCI error code. Lower layers are folded in
/// through `From` so handlers can use `?` throughout.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Upload was malformed or is in a state that cannot accept the request
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Upload session not found
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Invalid digest format
    #[error("provided digest is invalid: {0}")]
    DigestInvalid(String),

    /// Digest mismatch
    #[error("provided digest did not match uploaded content")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// A manifest references a blob or manifest the registry does not have
    #[error("manifest references unknown content: {0}")]
    ManifestBlobUnknown(String),

    /// Invalid manifest
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Repository not found
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Content length does not agree with the request
    #[error("provided length did not match content length: {0}")]
    SizeInvalid(String),

    /// Manifest body is larger than the configured limit
    #[error("manifest exceeds {limit} bytes")]
    ManifestTooLarge {
        /// The configured limit
        limit: usize,
    },

    /// Invalid tag
    #[error("manifest tag did not match URI: {0}")]
    TagInvalid(String),

    /// Authentication required
    #[error("authentication required")]
    Unauthorized,

    /// The caller may not perform this action
    #[error("requested access to the resource is denied: {0}")]
    Denied(String),

    /// A namespace or repository limit would be exceeded
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No route handled this method and path
    #[error("the operation is unsupported")]
    MethodNotAllowed,

    /// Media type not accepted
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Bad `n` query parameter
    #[error("invalid number of results requested: {0}")]
    PaginationNumberInvalid(String),

    /// Range not satisfiable
    #[error("requested range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// Concurrent modification of the same resource
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request ran past the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Metadata error
    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MetadataError> for RegistryError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::QuotaExceeded(message) => RegistryError::QuotaExceeded(message),
            MetadataError::Conflict(message) => RegistryError::Conflict(message),
            other => RegistryError::Metadata(other),
        }
    }
}

impl From<DigestError> for RegistryError {
    fn from(err: DigestError) -> Self {
        RegistryError::DigestInvalid(err.to_string())
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::NameUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::BlobUploadInvalid(_)
            | RegistryError::DigestInvalid(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::ManifestInvalid(_)
            | RegistryError::NameInvalid(_)
            | RegistryError::SizeInvalid(_)
            | RegistryError::TagInvalid(_)
            | RegistryError::PaginationNumberInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::ManifestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Denied(_) | RegistryError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            RegistryError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Storage(err) => storage_status(err),
            RegistryError::Metadata(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            RegistryError::Metadata(err) if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Metadata(_) | RegistryError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadInvalid(_)
            | RegistryError::RangeNotSatisfiable(_)
            | RegistryError::Conflict(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::DigestInvalid(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestInvalid(_) => "MANIFEST_INVALID",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::SizeInvalid(_) | RegistryError::ManifestTooLarge { .. } => {
                "SIZE_INVALID"
            }
            RegistryError::TagInvalid(_) => "TAG_INVALID",
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::Denied(_) | RegistryError::QuotaExceeded(_) => "DENIED",
            RegistryError::MethodNotAllowed | RegistryError::UnsupportedMediaType(_) => {
                "UNSUPPORTED"
            }
            RegistryError::PaginationNumberInvalid(_) => "PAGINATION_NUMBER_INVALID",
            RegistryError::Timeout(_)
            | RegistryError::Storage(_)
            | RegistryError::Metadata(_)
            | RegistryError::Io(_) => "UNKNOWN",
        }
    }

    /// Structured detail for the error envelope, if any.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            RegistryError::DigestMismatch { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            RegistryError::ManifestTooLarge { limit } => json!({ "limit": limit }),
            _ => serde_json::Value::Null,
        }
    }
}

impl Transient for RegistryError {
    /// Only metadata failures; storage calls retry on their own.
    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Metadata(err) if err.is_transient())
    }
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err.kind() {
        StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
        StorageErrorKind::ServiceUnavailable | StorageErrorKind::RetriesExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    detail: serde_json::Value,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = %self, code, "registry request failed");
        } else {
            tracing::debug!(error = %self, code, "registry request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message,
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
