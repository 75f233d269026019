//! Error types for gateway operations.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error type for gateway operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No endpoint registered under this id.
    #[error("Unknown endpoint '{0}'")]
    EndpointNotFound(String),

    /// No active resource under this id.
    #[error("Unknown resource '{0}'")]
    ResourceNotFound(String),

    /// The endpoint already has a publisher (or a publish in flight).
    #[error("Endpoint '{0}' already in use")]
    InUse(String),

    /// An endpoint with this id already exists.
    #[error("Endpoint '{0}' already exists")]
    EndpointExists(String),

    /// Missing or rejected Bearer token.
    #[error("Unauthorized")]
    Unauthorized,

    /// Wrong content type or an offer that is not an SDP.
    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),

    /// If-Match did not meet the ETag precondition.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Trickle support is globally disabled.
    #[error("Trickle support is disabled")]
    TrickleDisabled,

    /// The backend connection is not established.
    #[error("Backend unavailable")]
    BackendUnavailable,

    /// The backend rejected a request, timed out, or went away mid-request.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Malformed caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error maps to on the WHIP surface.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::EndpointNotFound(_) | Error::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InUse(_) | Error::Unauthorized => StatusCode::FORBIDDEN,
            Error::EndpointExists(_) => StatusCode::CONFLICT,
            Error::UnsupportedMedia(_) => StatusCode::NOT_ACCEPTABLE,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::TrickleDisabled => StatusCode::METHOD_NOT_ALLOWED,
            Error::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::Backend(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(self.to_string()))
            .unwrap_or_else(|_| self.status().into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::EndpointNotFound("e".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::InUse("e".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::Unauthorized.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::UnsupportedMedia("x".into()).status(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(Error::TrickleDisabled.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(Error::BackendUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::Backend("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::PreconditionFailed("etag".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
    }
}
