use lake_gateway::{
    auth_client::AuthClient,
    cache::{CacheClient, MemoryConnector, MemoryStore},
    config::{CacheBackend, Config},
    handlers::AppState,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Auth service mock: `good` resolves to user `u-1`, everything else is rejected,
/// `ann`/`pw` authenticates.
pub async fn setup_auth_mock() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .and(body_json(json!({"token": "good"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"user_id": "u-1", "reference_id": "ref-1"})),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/validate"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/authenticate"))
        .and(body_json(json!({"username": "ann", "password": "pw"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "good", "expires_in": 300})),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/authenticate"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    server
}

pub fn test_config(auth_address: &str) -> Config {
    let mut config = Config::default();
    config.cache.backend = CacheBackend::Memory;
    config.auth.address = auth_address.to_string();
    config.auth.retry_backoff_seconds = 0;
    config.auth.max_retries = 0;
    config
}

/// App state backed by an in-memory cache the test can inspect.
pub async fn test_state(config: Config) -> (AppState, MemoryStore) {
    let store = MemoryStore::new();
    let cache = CacheClient::connect(
        config.cache.clone(),
        Arc::new(MemoryConnector::new(store.clone())),
    )
    .await
    .unwrap();
    let auth = AuthClient::new(&config.auth).unwrap();

    let state = AppState {
        config: Arc::new(config),
        cache: Arc::new(cache),
        auth: Arc::new(auth),
    };
    (state, store)
}
