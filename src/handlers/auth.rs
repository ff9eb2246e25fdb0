use axum::{body::Bytes, extract::State, Json};
use serde_json::Value;

use crate::auth_client::Credentials;
use crate::context::RequestContext;
use crate::error::AppError;
use crate::handlers::AppState;
use crate::logging::{get_logger, LogValue};

/// Exchange username/password for a session with the authentication service
pub async fn authenticate(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let log = get_logger("authHandler");

    let credentials: Credentials = serde_json::from_slice(&body).map_err(|e| {
        log.warnw(
            &ctx,
            "unreadable authenticate request",
            &[("cause", LogValue::error(&e))],
        );
        AppError::BadRequest("Request body must be {\"username\",\"password\"}".to_string())
    })?;

    match state.auth.authenticate(&ctx, &credentials).await {
        Ok(session) => Ok(Json(session)),
        Err(err) => {
            log.errore(&ctx, "authenticate failed", &err, &[]);
            Err(err.into())
        }
    }
}
