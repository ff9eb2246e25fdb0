use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Environment variable prefix, e.g. `LAKE_CACHE__HOST`
pub const ENV_PREFIX: &str = "LAKE";

/// Pre-existing deployment variables and the config keys they override.
const LEGACY_ENV: [(&str, &str); 9] = [
    ("RedisConfig_Host", "cache.host"),
    ("RedisConfig_Port", "cache.port"),
    ("RedisConfig_Password", "cache.password"),
    ("RedisConfig_MaxRedirects", "cache.max_redirects"),
    ("GRPC_CLIENT_CONFIG_L_AUTH", "auth.address"),
    ("GRPC_CLIENT_CONFIG_L_AUTH_TIMEOUT_IN_SEC", "auth.timeout_seconds"),
    ("GRPC_CLIENT_CONFIG_L_AUTH_RETRY_BACKOFF_IN_SEC", "auth.retry_backoff_seconds"),
    ("APM_ENABLE", "access_log.enabled"),
    ("LOG_LEVEL", "logging.level"),
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Blanket upper bound for every inbound request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Largest request/response body the request logger buffers
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `console`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

/// Distributed cache connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    /// 0 keeps the client library default
    #[serde(default)]
    pub max_redirects: u32,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// How long a resolved bearer token stays cached
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            host: default_cache_host(),
            port: default_cache_port(),
            password: String::new(),
            max_redirects: 0,
            response_timeout_ms: default_response_timeout_ms(),
            token_ttl_seconds: default_token_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote authentication service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_auth_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_seconds: default_auth_timeout(),
            retry_backoff_seconds: default_retry_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_metrics_endpoint(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Redis
}

fn default_cache_host() -> String {
    "you-redis-cluster.youapp.svc".to_string()
}

fn default_cache_port() -> u16 {
    6379
}

fn default_response_timeout_ms() -> u64 {
    3000
}

fn default_token_ttl() -> u64 {
    300
}

fn default_auth_timeout() -> u64 {
    30
}

fn default_retry_backoff() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

/// Load configuration from the optional file at `path` and the process environment.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    load_config_from(path, None)
}

/// Same as [`load_config`] but reads variables from `env` instead of the process
/// environment when given.
pub fn load_config_from(
    path: &Path,
    env: Option<HashMap<String, String>>,
) -> anyhow::Result<Config> {
    let lookup = |name: &str| -> Option<String> {
        match &env {
            Some(map) => map.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
    };

    let mut builder = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .source(env.clone()),
        );

    for (name, key) in LEGACY_ENV {
        builder = builder.set_override_option(key, lookup(name))?;
    }

    let cfg: Config = builder.build()?.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        anyhow::bail!("server.port must be non-zero");
    }

    if cfg.server.request_timeout_seconds == 0 {
        anyhow::bail!("server.request_timeout_seconds must be non-zero");
    }

    if cfg.cache.backend == CacheBackend::Redis && cfg.cache.host.is_empty() {
        anyhow::bail!("cache.host is required for the redis backend");
    }

    if cfg.auth.address.is_empty() {
        anyhow::bail!("auth.address must be configured");
    }

    if !cfg.auth.address.starts_with("http://") && !cfg.auth.address.starts_with("https://") {
        anyhow::bail!("auth.address must be an http(s) URL: {}", cfg.auth.address);
    }

    if cfg.metrics.enabled && !cfg.metrics.endpoint.starts_with('/') {
        anyhow::bail!("metrics.endpoint must start with '/': {}", cfg.metrics.endpoint);
    }

    match cfg.logging.format.as_str() {
        "json" | "console" => {}
        other => anyhow::bail!("Invalid logging.format: {}", other),
    }

    Ok(())
}
