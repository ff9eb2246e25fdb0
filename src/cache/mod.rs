//! Resilient distributed cache client.
//!
//! [`CacheClient`] stores typed values as bincode bytes in a key-value
//! backend. When an operation fails with an I/O timeout the client replaces
//! its connection and retries the operation exactly once. Concurrent callers
//! that hit the same broken connection share a single reconnect.

pub mod memory;
pub mod redis_store;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{CacheBackend, CacheConfig};
use crate::context::RequestContext;
use crate::logging::{get_logger, LogValue};
use crate::metrics;

pub use memory::{MemoryConnector, MemoryStore};
pub use redis_store::RedisConnector;

/// Error text suffix that marks a failure as a transport timeout.
pub const IO_TIMEOUT_SUFFIX: &str = "i/o timeout";

/// Backend failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}: i/o timeout")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error is a transport timeout that warrants a reconnect.
    pub fn is_io_timeout(&self) -> bool {
        self.to_string().ends_with(IO_TIMEOUT_SUFFIX)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode cache value: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode cache value: {0}")]
    Decode(#[source] bincode::Error),

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Raw byte-level operations of a cache backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// A zero `expiration` stores the value without expiry.
    async fn set(&self, key: &str, value: &[u8], expiration: Duration) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Opens fresh backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &CacheConfig) -> Result<Box<dyn KvStore>, StoreError>;
}

struct Connection {
    store: Box<dyn KvStore>,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Op<'a> {
    Get(&'a str),
    Set(&'a str, &'a [u8], Duration),
    Del(&'a str),
}

impl Op<'_> {
    fn name(&self) -> &'static str {
        match self {
            Op::Get(_) => "get",
            Op::Set(..) => "set",
            Op::Del(_) => "del",
        }
    }

    async fn apply(self, store: &dyn KvStore) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Op::Get(key) => store.get(key).await,
            Op::Set(key, value, expiration) => store.set(key, value, expiration).await.map(|_| None),
            Op::Del(key) => store.del(key).await.map(|_| None),
        }
    }
}

pub struct CacheClient {
    conn: ArcSwap<Connection>,
    reconnect_lock: Mutex<()>,
    connector: Arc<dyn Connector>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("address", &self.config.address())
            .field("generation", &self.generation())
            .finish()
    }
}

impl CacheClient {
    /// Connect using the backend selected in `config`.
    pub async fn from_config(config: CacheConfig) -> Result<Self, StoreError> {
        let connector: Arc<dyn Connector> = match config.backend {
            CacheBackend::Redis => Arc::new(RedisConnector),
            CacheBackend::Memory => Arc::new(MemoryConnector::default()),
        };
        Self::connect(config, connector).await
    }

    /// Open the initial connection and verify it with a ping.
    pub async fn connect(
        config: CacheConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StoreError> {
        let log = get_logger("cache-client");
        let ctx = RequestContext::new();
        log.debugw(
            &ctx,
            "connecting cache client",
            &[("address", LogValue::from(config.address()))],
        );

        let store = connector.connect(&config).await?;
        store.ping().await?;

        log.debugw(&ctx, "cache client connected", &[]);

        Ok(Self {
            conn: ArcSwap::from_pointee(Connection {
                store,
                generation: 0,
            }),
            reconnect_lock: Mutex::new(()),
            connector,
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of times the connection has been replaced.
    pub fn generation(&self) -> u64 {
        self.conn.load().generation
    }

    /// Fetch and decode the value under `key`. `Ok(None)` means the key is absent.
    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let result = match self.execute(ctx, Op::Get(key)).await {
            Ok(Some(bytes)) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(CacheError::Decode),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        metrics::record_cache_operation("get", get_outcome(&result));
        result
    }

    /// Encode and store `value`. A zero `expiration` means no expiry.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        key: &str,
        expiration: Duration,
        value: &T,
    ) -> Result<(), CacheError> {
        let bytes = bincode::serialize(value).map_err(CacheError::Encode)?;
        let result = self.execute(ctx, Op::Set(key, &bytes, expiration)).await;
        metrics::record_cache_operation("set", outcome(&result));
        result.map(|_| ())
    }

    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<(), CacheError> {
        let result = self.execute(ctx, Op::Del(key)).await;
        metrics::record_cache_operation("del", outcome(&result));
        result.map(|_| ())
    }

    /// Force a fresh connection, replacing the current one.
    pub async fn refresh(&self, ctx: &RequestContext) -> Result<(), CacheError> {
        let generation = self.generation();
        bounded(ctx, self.reconnect(ctx, generation)).await??;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        op: Op<'_>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let conn = self.conn.load_full();

        match bounded(ctx, op.apply(conn.store.as_ref())).await? {
            Ok(value) => Ok(value),
            Err(err) if err.is_io_timeout() => {
                let log = get_logger("cache-client");
                log.errore(
                    ctx,
                    &format!("timeout error with {}", op.name()),
                    &err,
                    &[],
                );

                let conn = bounded(ctx, self.reconnect(ctx, conn.generation)).await??;
                Ok(bounded(ctx, op.apply(conn.store.as_ref())).await??)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the connection that failed at `failed_generation`.
    ///
    /// Callers that observed the same broken connection serialize on the
    /// lock; all but the first find a newer generation and reuse it.
    async fn reconnect(
        &self,
        ctx: &RequestContext,
        failed_generation: u64,
    ) -> Result<Arc<Connection>, StoreError> {
        let _guard = self.reconnect_lock.lock().await;

        let current = self.conn.load_full();
        if current.generation != failed_generation {
            return Ok(current);
        }

        let log = get_logger("cache-client");
        log.infow(
            ctx,
            "reconnecting cache client",
            &[("generation", LogValue::from(failed_generation + 1))],
        );

        let store = self.connector.connect(&self.config).await?;
        store.ping().await?;

        let fresh = Arc::new(Connection {
            store,
            generation: failed_generation + 1,
        });
        self.conn.store(Arc::clone(&fresh));
        metrics::record_cache_reconnect();

        Ok(fresh)
    }
}

fn outcome<T>(result: &Result<T, CacheError>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

fn get_outcome<T>(result: &Result<Option<T>, CacheError>) -> &'static str {
    match result {
        Ok(Some(_)) => "hit",
        Ok(None) => "miss",
        Err(_) => "error",
    }
}

/// Run `fut` within the time left on the context deadline.
async fn bounded<F, T>(ctx: &RequestContext, fut: F) -> Result<T, CacheError>
where
    F: Future<Output = T>,
{
    match ctx.remaining() {
        Some(left) if left.is_zero() => Err(CacheError::DeadlineExceeded),
        Some(left) => tokio::time::timeout(left, fut)
            .await
            .map_err(|_| CacheError::DeadlineExceeded),
        None => Ok(fut.await),
    }
}
