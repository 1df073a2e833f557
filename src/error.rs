//! Error types for Gafaelfawr
//!
//! One crate-wide error enum covers the whole surface taxonomy. The HTTP
//! edge maps each variant to a status code and a `{detail: [...]}` JSON
//! body; internal code propagates variants with `?`.

use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for Gafaelfawr
pub type Result<T> = std::result::Result<T, Error>;

/// Gafaelfawr errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No credentials were presented, or the presented credentials are not
    /// recognized
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The presented token has expired
    #[error("Token expired")]
    TokenExpired,

    /// The token does not carry the scopes the request requires
    #[error("Insufficient scope: {0}")]
    InsufficientScope(String),

    /// A user token with this name already exists for this user
    #[error("Duplicate token name: {0}")]
    DuplicateTokenName(String),

    /// A token string did not parse as `gt-<key>.<secret>`
    #[error("Malformed token")]
    MalformedToken,

    /// An upstream identity provider failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// The requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The authenticated user may not perform this action
    #[error("Permission denied: {0}")]
    Forbidden(String),

    /// Request body or parameters failed validation
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::Internal(format!("JWT error: {e}"))
    }
}

impl Error {
    /// The HTTP status this error renders as at the API edge.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials(_) | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::DuplicateTokenName(_) => StatusCode::CONFLICT,
            Self::MalformedToken | Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable type tag used in `detail[].type`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::TokenExpired => "token_expired",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::DuplicateTokenName(_) => "duplicate_token_name",
            Self::MalformedToken => "malformed_token",
            Self::Provider(_) => "provider_error",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "permission_denied",
            Self::Validation(_) => "invalid_request",
            Self::Database(_) => "database_error",
            Self::Cache(_) => "cache_error",
            _ => "internal_error",
        }
    }

    /// Whether a retry of the failed backend call might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cache(_) | Self::Io(_) => true,
            Self::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "detail": [{"msg": self.to_string(), "type": self.kind(), "loc": ["request"]}]
        }));
        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [("Retry-After", "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            Error::InvalidCredentials("no token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::InsufficientScope("read:all".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::DuplicateTokenName("ci".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::MalformedToken.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            Error::Provider("github down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::NotFound("token".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::Cache("connection reset".into()).is_transient());
        assert!(!Error::MalformedToken.is_transient());
        assert!(!Error::Forbidden("nope".into()).is_transient());
    }
}
