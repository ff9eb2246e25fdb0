use anyhow::Result;
use axum::{
    http::{header, HeaderName, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    auth_client::AuthClient,
    cache::CacheClient,
    config::Config,
    context::{context_middleware, RequestContext},
    error::AppError,
    handlers::{self, AppState},
    logging::{get_logger, LogValue},
    metrics,
    middleware::{access_log, auth_filter, request_logger},
    signals::setup_signal_handlers,
};

/// Stan of the process-level context
pub const MAIN_STAN: &str = "main-process";

/// Start the gateway server
///
/// This function:
/// 1. Initializes metrics
/// 2. Connects the cache (one ping) and builds the auth client
/// 3. Sets up signal handlers for graceful shutdown
/// 4. Binds to the configured address and serves until a shutdown signal
/// 5. Drains in-flight requests for at most `shutdown_timeout_seconds`
pub async fn start_server(config: Config) -> Result<()> {
    let ctx = RequestContext::with_stan(MAIN_STAN);
    let log = get_logger("lake-gateway");

    let metrics_handle = if config.metrics.enabled {
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    let state = build_state(config).await?;
    let config = Arc::clone(&state.config);
    let app = create_router(state, metrics_handle);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    log.infow(
        &ctx,
        "listening",
        &[
            ("address", LogValue::from(addr.to_string())),
            ("cache", LogValue::from(config.cache.address())),
            ("auth", LogValue::from(config.auth.address.as_str())),
        ],
    );

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut drain_rx = shutdown_tx.subscribe();

    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
    });

    tokio::select! {
        result = &mut server => {
            signal_handle.abort();
            result??;
        }
        signal = drain_rx.recv() => {
            let name = signal.map(|s| s.name()).unwrap_or("unknown");
            log.infow(&ctx, "stopping service", &[("signal", LogValue::from(name))]);

            let drain = Duration::from_secs(config.server.shutdown_timeout_seconds);
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => result??,
                Err(_) => {
                    log.warnw(
                        &ctx,
                        "shutdown timeout elapsed, dropping open connections",
                        &[("timeoutSeconds", LogValue::from(drain.as_secs()))],
                    );
                    server.abort();
                }
            }
        }
    }

    log.infow(&ctx, "service stopped", &[]);
    Ok(())
}

/// Connect the cache and build the remote clients.
pub async fn build_state(config: Config) -> Result<AppState> {
    let cache = CacheClient::from_config(config.cache.clone()).await?;
    let auth = AuthClient::new(&config.auth)?;

    Ok(AppState {
        config: Arc::new(config),
        cache: Arc::new(cache),
        auth: Arc::new(auth),
    })
}

/// Create the Axum router with all routes and middleware
///
/// Layers, outermost first: panic catcher, request context, request logger,
/// tracing, CORS, timeout. The `/v1` routes add the auth filter and, when
/// enabled, the access-log span.
#[allow(deprecated)]
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let config = Arc::clone(&state.config);
    let request_timeout = Duration::from_secs(config.server.request_timeout_seconds);

    let mut v1 = Router::new()
        .route("/healthcheck", get(handlers::health::health_check))
        .route("/authenticate", post(handlers::auth::authenticate));
    if config.access_log.enabled {
        v1 = v1.layer(middleware::from_fn(access_log));
    }
    let v1 = v1
        .layer(middleware::from_fn_with_state(state.clone(), auth_filter))
        .with_state(state);

    let mut app = Router::new().nest("/v1", v1);
    if let Some(handle) = metrics_handle {
        app = app.route(
            &config.metrics.endpoint,
            get(handlers::metrics_handler::metrics).with_state(handle),
        );
    }

    app.layer(TimeoutLayer::new(request_timeout))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            config.server.max_body_bytes,
            request_logger,
        ))
        .layer(middleware::from_fn_with_state(
            request_timeout,
            context_middleware,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-goog-authuser"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::LINK])
        .allow_credentials(true)
        .max_age(Duration::from_secs(300))
}

fn panic_response(_payload: Box<dyn Any + Send + 'static>) -> Response {
    AppError::InternalError("handler panicked".to_string()).into_response()
}
