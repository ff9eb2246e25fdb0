use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Instrument;

use crate::context::{ContextKey, RequestContext};

/// Service name reported on access spans
pub const API_SERVER: &str = "lake-gateway";

/// Run requests from an identified caller inside an `access` span.
pub async fn access_log(req: Request, next: Next) -> Response {
    let user_id = req
        .extensions()
        .get::<RequestContext>()
        .and_then(|ctx| ctx.read(ContextKey::USER_REFERENCE_ID))
        .map(str::to_string);

    match user_id {
        Some(user_id) => {
            let span = tracing::info_span!(
                "access",
                user_id = %user_id,
                api_server = API_SERVER,
            );
            next.run(req).instrument(span).await
        }
        None => next.run(req).await,
    }
}
