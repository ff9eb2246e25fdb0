use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::auth_client::AuthClientError;
use crate::cache::CacheError;

/// Application error types
#[derive(Debug)]
pub enum AppError {
    /// Malformed client request
    BadRequest(String),
    /// Missing or rejected credentials
    Unauthorized(String),
    /// Authentication service answered with an error status
    UpstreamError { status: StatusCode, message: String },
    /// Authentication service could not be reached
    AuthService(AuthClientError),
    /// Cache failure
    Cache(CacheError),
    /// Request deadline passed before the work completed
    DeadlineExceeded,
    /// Internal server error
    InternalError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::UpstreamError { status, message } => {
                write!(f, "Upstream error ({}): {}", status, message)
            }
            Self::AuthService(err) => write!(f, "Auth service error: {}", err),
            Self::Cache(err) => write!(f, "Cache error: {}", err),
            Self::DeadlineExceeded => write!(f, "Deadline exceeded"),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AuthService(err) => Some(err),
            Self::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamError { status, .. } if status.is_client_error() => *status,
            Self::UpstreamError { .. } | Self::AuthService(_) => StatusCode::BAD_GATEWAY,
            Self::Cache(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to show to the client.
    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(msg) | Self::Unauthorized(msg) => msg.clone(),
            Self::UpstreamError { status, .. } if status.is_client_error() => status
                .canonical_reason()
                .unwrap_or("Request rejected")
                .to_string(),
            Self::UpstreamError { .. } | Self::AuthService(_) => {
                "Authentication service unavailable".to_string()
            }
            Self::Cache(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::DeadlineExceeded => "Request timed out".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": error_type_name(&self),
            }
        }));

        (self.status(), body).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::BadRequest(_) => "bad_request",
        AppError::Unauthorized(_) => "unauthorized",
        AppError::UpstreamError { .. } => "upstream_error",
        AppError::AuthService(_) => "auth_service_error",
        AppError::Cache(_) => "cache_error",
        AppError::DeadlineExceeded => "deadline_exceeded",
        AppError::InternalError(_) => "internal_error",
    }
}

impl From<AuthClientError> for AppError {
    fn from(err: AuthClientError) -> Self {
        match err {
            AuthClientError::Status { status, message } => Self::UpstreamError { status, message },
            AuthClientError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::AuthService(other),
        }
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::Cache(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("Invalid JSON: {}", err))
    }
}
