use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use crate::context::RequestContext;
use crate::error::AppError;
use crate::logging::{get_logger, PanicPayload};
use crate::metrics;

/// Route label used when no route matched
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Log every request and its response through the `httpLogger` logger.
///
/// Request and response bodies are buffered (up to `max_body_bytes`) so they
/// can be annotated. The handler runs under `catch_unwind`; a panic is logged
/// on the canonical line and then resumed.
pub async fn request_logger(
    State(max_body_bytes): State<usize>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::from_headers(req.headers()));

    let mut log = get_logger("httpLogger");
    let (parts, body) = req.into_parts();

    let method = parts.method.to_string();
    let route = route_label(&parts);

    log.add("method", method.as_str());
    log.add("remote", remote_addr(&parts));
    log.add("proto", format!("{:?}", parts.version));
    log.add("path", full_url(&parts));

    let body = match to_bytes(body, max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            log.warnw(&ctx, "request body too large", &[]);
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };
    if !body.is_empty() {
        log.add("reqBody", String::from_utf8_lossy(&body).into_owned());
    }
    log.infow(&ctx, "http request", &[]);

    let req = Request::from_parts(parts, Body::from(body));
    let response = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            log.add("httpStatus", StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            metrics::record_request(&method, &route, 500, started.elapsed());
            if let Err(payload) =
                log.canonical(&ctx, "http response", None, Some(PanicPayload::new(panic)))
            {
                payload.resume();
            }
            return AppError::InternalError("handler panicked".to_string()).into_response();
        }
    };

    let status = response.status();
    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            log.add("httpStatus", status.as_u16());
            let _ = log.canonical(&ctx, "http response", Some(&err), None);
            return AppError::InternalError(err.to_string()).into_response();
        }
    };

    log.add("httpStatus", status.as_u16());
    if body.len() <= max_body_bytes {
        log.add("rspBody", String::from_utf8_lossy(&body).into_owned());
    } else {
        log.add("rspBodyBytes", body.len());
    }
    metrics::record_request(&method, &route, status.as_u16(), started.elapsed());

    let _ = log.canonical(&ctx, "http response", None, None);

    Response::from_parts(parts, Body::from(body))
}

/// Metrics label for the request's route. Unrouted paths share one label.
fn route_label(parts: &axum::http::request::Parts) -> String {
    parts
        .extensions
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

fn remote_addr(parts: &axum::http::request::Parts) -> String {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        return forwarded.to_string();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default()
}

/// `scheme://host/path?query` of the inbound request.
fn full_url(parts: &axum::http::request::Parts) -> String {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}
