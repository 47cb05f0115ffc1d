use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Gatehouse application
#[derive(Error, Debug)]
pub enum GatehouseError {
    // Admission control
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    AdmissionRejected { retry_after: u64 },

    // Resource pool
    #[error("Resource pool exhausted, no resource freed within the wait budget")]
    ResourceExhausted,

    // Upstream fetch errors
    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Upstream connection failed: {0}")]
    UpstreamConnectionFailed(String),

    #[error("Upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Undecodable content: {0}")]
    UndecodableContent(String),

    // Content rewriting
    #[error("Rewrite failed: {0}")]
    RewriteFailure(String),

    // Sessions
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Gatehouse operations
pub type Result<T> = std::result::Result<T, GatehouseError>;

impl GatehouseError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatehouseError::InvalidRequest(_)
            | GatehouseError::InvalidTargetUrl(_)
            | GatehouseError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            GatehouseError::SessionNotFound(_) => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            GatehouseError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            GatehouseError::UpstreamConnectionFailed(_)
            | GatehouseError::UndecodableContent(_)
            | GatehouseError::Http(_) => StatusCode::BAD_GATEWAY,

            // Upstream non-success mirrors the upstream status when valid
            GatehouseError::UpstreamStatus { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            // 503 Service Unavailable
            GatehouseError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            GatehouseError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            GatehouseError::RewriteFailure(_)
            | GatehouseError::Io(_)
            | GatehouseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind tag used in error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            GatehouseError::AdmissionRejected { .. } => "admission_rejected",
            GatehouseError::ResourceExhausted => "resource_exhausted",
            GatehouseError::UpstreamTimeout => "upstream_timeout",
            GatehouseError::UpstreamConnectionFailed(_) => "upstream_connection_failed",
            GatehouseError::UpstreamStatus { .. } => "upstream_status",
            GatehouseError::UndecodableContent(_) => "undecodable_content",
            GatehouseError::RewriteFailure(_) => "rewrite_failure",
            GatehouseError::SessionNotFound(_) => "session_not_found",
            GatehouseError::InvalidRequest(_) => "invalid_request",
            GatehouseError::InvalidTargetUrl(_) => "invalid_target_url",
            GatehouseError::InvalidConfig(_) => "invalid_config",
            GatehouseError::Io(_) => "io",
            GatehouseError::Http(_) => "http",
            GatehouseError::Internal(_) => "internal",
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for GatehouseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });

        if let GatehouseError::AdmissionRejected { retry_after } = &self {
            return (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(body),
            )
                .into_response();
        }

        (status, Json(body)).into_response()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GatehouseError {
    fn from(err: url::ParseError) -> Self {
        GatehouseError::InvalidTargetUrl(err.to_string())
    }
}

// Convert from reqwest errors, preserving the failure class
impl From<reqwest::Error> for GatehouseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatehouseError::UpstreamTimeout
        } else if err.is_connect() {
            GatehouseError::UpstreamConnectionFailed(err.to_string())
        } else if err.is_decode() {
            GatehouseError::UndecodableContent(err.to_string())
        } else {
            GatehouseError::Http(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            GatehouseError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatehouseError::SessionNotFound("abc".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatehouseError::AdmissionRejected { retry_after: 60 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatehouseError::ResourceExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatehouseError::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatehouseError::UpstreamConnectionFailed("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatehouseError::UndecodableContent("garbled".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatehouseError::RewriteFailure("bad markup".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_status_mirrors_code() {
        assert_eq!(
            GatehouseError::UpstreamStatus { status: 403 }.status_code(),
            StatusCode::FORBIDDEN
        );
        // An out-of-range code falls back to 502
        assert_eq!(
            GatehouseError::UpstreamStatus { status: 23 }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(GatehouseError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!GatehouseError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(GatehouseError::ResourceExhausted.is_server_error());
        assert!(!GatehouseError::ResourceExhausted.is_client_error());
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(
            GatehouseError::AdmissionRejected { retry_after: 1 }.kind(),
            "admission_rejected"
        );
        assert_eq!(GatehouseError::UpstreamTimeout.kind(), "upstream_timeout");
        assert_eq!(
            GatehouseError::RewriteFailure("x".into()).kind(),
            "rewrite_failure"
        );
    }
}
