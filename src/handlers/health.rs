use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::context::RequestContext;
use crate::logging::get_logger;

/// Liveness probe
pub async fn health_check(ctx: RequestContext) -> impl IntoResponse {
    get_logger("healthHandler").infow(&ctx, "Health check called", &[]);
    (StatusCode::OK, Json(json!({ "health": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_returns_ok() {
        let response = health_check(RequestContext::with_stan("probe"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"health":true}"#);
    }
}
