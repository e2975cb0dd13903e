//! Error types for idbroker

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for idbroker
pub type Result<T> = std::result::Result<T, Error>;

/// idbroker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, malformed, expired or unverifiable caller credential
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential, but not the authorized caller
    #[error("Forbidden")]
    Forbidden,

    /// Malformed request input
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Operation on an identity that is not tracked
    #[error("Not found: {0}")]
    NotFound(String),

    /// Identity platform failure (other than benign absence)
    #[error("Identity provider error: {0}")]
    Provider(String),

    /// Liveness store failure
    #[error("Liveness store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the gateway
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Provider(_) | Self::Store(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for response bodies
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::Validation(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Provider(_) => "provider_error",
            Self::Store(_) => "store_error",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }
        let body = Json(json!({"error": self.code(), "message": self.to_string()}));
        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
