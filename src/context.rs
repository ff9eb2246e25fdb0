//! Request correlation context.
//!
//! A [`RequestContext`] carries string metadata (the stan, the user id, ...)
//! through a call chain. Values travel in two directions: *incoming* values
//! mirrored from the inbound request, and *outgoing* values this process adds
//! for downstream calls. Reads prefer outgoing values, so local enrichment
//! shadows inherited metadata, and within one direction the most recently
//! added value wins.
//!
//! Contexts are immutable. [`RequestContext::add`] returns an extended copy
//! that shares the existing chain with its parent.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Metadata key carried by a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(&'static str);

impl ContextKey {
    /// Correlation id, same as the request id from the client or generated here
    pub const STAN: ContextKey = ContextKey("x-stan-id");
    pub const USER_ID: ContextKey = ContextKey("x-user-id");
    pub const BASIC_AUTH_KEY: ContextKey = ContextKey("x-basic-auth-key");
    pub const BASIC_AUTH_SECRET: ContextKey = ContextKey("x-basic-auth-secret");
    /// Set by the auth filter once a bearer token has been resolved
    pub const USER_REFERENCE_ID: ContextKey = ContextKey("x-user-reference-id");

    /// Keys propagated to downstream calls
    pub const PROPAGATED: [ContextKey; 5] = [
        Self::STAN,
        Self::USER_ID,
        Self::BASIC_AUTH_KEY,
        Self::BASIC_AUTH_SECRET,
        Self::USER_REFERENCE_ID,
    ];

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

#[derive(Debug)]
struct Entry {
    key: Box<str>,
    value: Box<str>,
    parent: Option<Arc<Entry>>,
}

/// Persistent singly linked list; the head is the most recently added entry.
#[derive(Debug, Clone, Default)]
struct Chain(Option<Arc<Entry>>);

impl Chain {
    fn push(&self, key: &str, value: &str) -> Chain {
        Chain(Some(Arc::new(Entry {
            key: key.into(),
            value: value.into(),
            parent: self.0.clone(),
        })))
    }

    fn latest(&self, key: &str) -> Option<&str> {
        let mut cursor = self.0.as_deref();
        while let Some(entry) = cursor {
            if &*entry.key == key {
                return Some(&entry.value);
            }
            cursor = entry.parent.as_deref();
        }
        None
    }
}

/// Immutable carrier of correlation metadata and the request deadline.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    outgoing: Chain,
    incoming: Chain,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a process entry point with a preset stan.
    pub fn with_stan(stan: impl AsRef<str>) -> Self {
        Self::new().add(ContextKey::STAN, stan)
    }

    /// Mirror the `x-*` headers of an inbound request as incoming metadata.
    ///
    /// Repeated headers are appended in order, so the last one is authoritative.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut incoming = Chain::default();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if !name.starts_with("x-") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                incoming = incoming.push(name, value);
            }
        }
        Self {
            incoming,
            ..Self::default()
        }
    }

    /// Returns a new context with `value` appended to the outgoing values of `key`.
    pub fn add(&self, key: ContextKey, value: impl AsRef<str>) -> Self {
        Self {
            outgoing: self.outgoing.push(key.as_str(), value.as_ref()),
            ..self.clone()
        }
    }

    /// Returns a new context with `value` appended to the incoming values of `key`.
    pub fn add_incoming(&self, key: ContextKey, value: impl AsRef<str>) -> Self {
        Self {
            incoming: self.incoming.push(key.as_str(), value.as_ref()),
            ..self.clone()
        }
    }

    /// Latest outgoing value of `key`, falling back to the latest incoming one.
    pub fn read(&self, key: ContextKey) -> Option<&str> {
        self.outgoing
            .latest(key.as_str())
            .or_else(|| self.incoming.latest(key.as_str()))
    }

    pub fn stan(&self) -> &str {
        self.read(ContextKey::STAN).unwrap_or_default()
    }

    pub fn user_id(&self) -> &str {
        self.read(ContextKey::USER_ID).unwrap_or_default()
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when the context has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Authoritative value of every propagated key, as headers for a downstream call.
    pub fn outgoing_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for key in ContextKey::PROPAGATED {
            let Some(value) = self.read(key) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(key.as_str()), value);
            }
        }
        headers
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext::from_headers(&parts.headers)))
    }
}

/// Build the request context, assign a stan when the caller sent none and
/// bound the request by `timeout`.
pub async fn context_middleware(
    State(timeout): State<Duration>,
    mut req: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::from_headers(req.headers());

    if ctx.read(ContextKey::STAN).is_none() {
        let stan = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ctx = ctx.add(ContextKey::STAN, stan);
    }
    ctx = ctx.with_deadline(Instant::now() + timeout);

    let stan = HeaderValue::from_str(ctx.stan()).ok();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Some(stan) = stan {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ContextKey::STAN.as_str()), stan);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn test_read_returns_last_outgoing_value() {
        let ctx = RequestContext::new()
            .add(ContextKey::USER_ID, "first")
            .add(ContextKey::USER_ID, "second");
        assert_eq!(ctx.read(ContextKey::USER_ID), Some("second"));
    }

    #[test]
    fn test_outgoing_shadows_incoming() {
        let ctx = RequestContext::new()
            .add_incoming(ContextKey::STAN, "from-client")
            .add_incoming(ContextKey::STAN, "from-client-2")
            .add(ContextKey::STAN, "local");
        assert_eq!(ctx.read(ContextKey::STAN), Some("local"));
    }

    #[test]
    fn test_falls_back_to_latest_incoming() {
        let ctx = RequestContext::new()
            .add_incoming(ContextKey::USER_ID, "u1")
            .add_incoming(ContextKey::USER_ID, "u2")
            .add(ContextKey::STAN, "s");
        assert_eq!(ctx.read(ContextKey::USER_ID), Some("u2"));
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let ctx = RequestContext::with_stan("main-process");
        assert_eq!(ctx.read(ContextKey::BASIC_AUTH_KEY), None);
        assert_eq!(ctx.user_id(), "");
    }

    #[test]
    fn test_add_does_not_mutate_parent() {
        let parent = RequestContext::with_stan("a");
        let child = parent.add(ContextKey::STAN, "b");
        assert_eq!(parent.stan(), "a");
        assert_eq!(child.stan(), "b");
    }

    #[test]
    fn test_from_headers_mirrors_x_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("x-stan-id", HeaderValue::from_static("abc"));
        headers.append("x-user-id", HeaderValue::from_static("u1"));
        headers.append("x-user-id", HeaderValue::from_static("u2"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.stan(), "abc");
        assert_eq!(ctx.user_id(), "u2");
        assert_eq!(ctx.read(ContextKey::new("authorization")), None);
    }

    #[test]
    fn test_outgoing_headers_use_authoritative_values() {
        let ctx = RequestContext::new()
            .add_incoming(ContextKey::USER_ID, "inherited")
            .add(ContextKey::USER_ID, "local")
            .add(ContextKey::STAN, "s-1");
        let headers = ctx.outgoing_headers();
        assert_eq!(headers.get("x-user-id").unwrap(), "local");
        assert_eq!(headers.get("x-stan-id").unwrap(), "s-1");
        assert!(headers.get("x-basic-auth-key").is_none());
    }

    #[test]
    fn test_deadline() {
        let ctx = RequestContext::new();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_expired());

        let expired = ctx.with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(expired.is_expired());

        let later = ctx.with_deadline(Instant::now() + Duration::from_secs(60));
        assert!(later.remaining().unwrap() > Duration::from_secs(50));
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/",
                get(|ctx: RequestContext| async move {
                    format!("{}|{}", ctx.stan(), ctx.deadline().is_some())
                }),
            )
            .layer(middleware::from_fn_with_state(
                Duration::from_secs(60),
                context_middleware,
            ))
    }

    #[tokio::test]
    async fn test_middleware_keeps_client_stan() {
        let request = Request::builder()
            .uri("/")
            .header("x-stan-id", "client-stan")
            .body(Body::empty())
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.headers().get("x-stan-id").unwrap(), "client-stan");

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"client-stan|true");
    }

    #[tokio::test]
    async fn test_middleware_uses_request_id_as_stan() {
        let request = Request::builder()
            .uri("/")
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.headers().get("x-stan-id").unwrap(), "req-42");
    }

    #[tokio::test]
    async fn test_middleware_generates_stan() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        let stan = response.headers().get("x-stan-id").unwrap().to_str().unwrap();
        assert_eq!(stan.len(), 36);
    }
}
