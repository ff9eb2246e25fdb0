use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::time::Duration;

use crate::auth_client::Identity;
use crate::context::{ContextKey, RequestContext};
use crate::error::AppError;
use crate::handlers::AppState;
use crate::logging::{get_logger, LogValue};

/// Cache key prefix for resolved bearer tokens
pub const TOKEN_CACHE_PREFIX: &str = "auth:token:";

/// Resolve the bearer token, when present, to a caller identity.
///
/// Requests without an `Authorization` header pass through anonymously.
/// A resolved identity is added to the request context as the user id and
/// user reference id.
pub async fn auth_filter(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(auth_header) = req.headers().get(header::AUTHORIZATION) else {
        return Ok(next.run(req).await);
    };

    let auth_header = auth_header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header".to_string()))?;
    let token = extract_bearer_token(auth_header)?.to_string();

    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::from_headers(req.headers()));

    let identity = resolve_identity(&state, &ctx, &token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid bearer token".to_string()))?;

    let reference_id = if identity.reference_id.is_empty() {
        &identity.user_id
    } else {
        &identity.reference_id
    };
    let ctx = ctx
        .add(ContextKey::USER_ID, &identity.user_id)
        .add(ContextKey::USER_REFERENCE_ID, reference_id);
    req.extensions_mut().insert(ctx);

    Ok(next.run(req).await)
}

/// Cached lookup first, then the authentication service.
async fn resolve_identity(
    state: &AppState,
    ctx: &RequestContext,
    token: &str,
) -> Result<Option<Identity>, AppError> {
    let log = get_logger("authFilter");
    let key = format!("{}{}", TOKEN_CACHE_PREFIX, token);

    match state.cache.get::<Identity>(ctx, &key).await {
        Ok(Some(identity)) => return Ok(Some(identity)),
        Ok(None) => {}
        Err(err) => log.warnw(
            ctx,
            "token cache lookup failed",
            &[("cause", LogValue::error(&err))],
        ),
    }

    let identity = state.auth.validate(ctx, token).await?;

    if let Some(identity) = &identity {
        let ttl = Duration::from_secs(state.config.cache.token_ttl_seconds);
        if let Err(err) = state.cache.set(ctx, &key, ttl, identity).await {
            log.warnw(
                ctx,
                "token cache store failed",
                &[("cause", LogValue::error(&err))],
            );
        }
    }

    Ok(identity)
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(auth_header: &str) -> Result<&str, AppError> {
    const BEARER_PREFIX: &str = "Bearer ";

    let Some(token) = auth_header.strip_prefix(BEARER_PREFIX) else {
        return Err(AppError::Unauthorized(
            "Authorization header must use Bearer scheme".to_string(),
        ));
    };

    if token.is_empty() {
        return Err(AppError::Unauthorized("Bearer token is empty".to_string()));
    }

    Ok(token)
}
