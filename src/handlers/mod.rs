pub mod auth;
pub mod health;
pub mod metrics_handler;

use std::sync::Arc;

use crate::auth_client::AuthClient;
use crate::cache::CacheClient;
use crate::config::Config;

/// Shared state handed to handlers and the auth filter.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheClient>,
    pub auth: Arc<AuthClient>,
}
