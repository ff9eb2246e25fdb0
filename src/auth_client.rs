//! Client for the remote authentication service.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::context::RequestContext;
use crate::logging::{get_logger, LogValue};
use crate::metrics;
use crate::retry::{execute_with_retry, is_retryable_status, RetryPolicy, Transient};

#[derive(Debug, Error)]
pub enum AuthClientError {
    #[error("auth service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth service returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("invalid auth service response: {0}")]
    InvalidResponse(String),

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl Transient for AuthClientError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                e.status()
                    .is_some_and(|status| is_retryable_status(status.as_u16()))
            }
            Self::Status { status, .. } => is_retryable_status(status.as_u16()),
            Self::InvalidResponse(_) | Self::DeadlineExceeded => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Caller identity resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub reference_id: String,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    policy: RetryPolicy,
}

impl AuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthClientError> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_string(),
            timeout,
            policy: RetryPolicy::new(
                config.max_retries,
                Duration::from_secs(config.retry_backoff_seconds),
            ),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange credentials for the service's session payload, returned as-is.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        credentials: &Credentials,
    ) -> Result<Value, AuthClientError> {
        let log = get_logger("auth-client");
        log.debugw(
            ctx,
            "authenticate",
            &[("username", LogValue::from(&credentials.username))],
        );

        let result = execute_with_retry(ctx, &self.policy, "authenticate", || async {
            let response = self.post(ctx, "/v1/authenticate", credentials).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status, response).await);
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| AuthClientError::InvalidResponse(e.to_string()))
        })
        .await;

        metrics::record_auth_request("authenticate", outcome(&result));
        result
    }

    /// Resolve a bearer token. `Ok(None)` means the service rejected the token.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<Option<Identity>, AuthClientError> {
        let body = json!({ "token": token });

        let result = execute_with_retry(ctx, &self.policy, "validate", || async {
            let response = self.post(ctx, "/v1/validate", &body).await?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(status_error(status, response).await);
            }
            response
                .json::<Identity>()
                .await
                .map(Some)
                .map_err(|e| AuthClientError::InvalidResponse(e.to_string()))
        })
        .await;

        let label = match &result {
            Ok(Some(_)) => "ok",
            Ok(None) => "rejected",
            Err(_) => "error",
        };
        metrics::record_auth_request("validate", label);
        result
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AuthClientError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .headers(ctx.outgoing_headers())
            .json(body);

        if let Some(left) = ctx.remaining() {
            if left.is_zero() {
                return Err(AuthClientError::DeadlineExceeded);
            }
            // a per-request timeout replaces the client-wide one
            request = request.timeout(left.min(self.timeout));
        }

        Ok(request.send().await?)
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> AuthClientError {
    let message = response.text().await.unwrap_or_default();
    AuthClientError::Status { status, message }
}

fn outcome<T>(result: &Result<T, AuthClientError>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}
