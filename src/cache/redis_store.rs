//! Redis Cluster backend.

use async_trait::async_trait;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::RedisError;
use std::time::Duration;

use super::{Connector, KvStore, StoreError};
use crate::config::CacheConfig;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_connection_refusal() {
            StoreError::Connect(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

pub struct RedisClusterStore {
    conn: ClusterConnection,
}

#[async_trait]
impl KvStore for RedisClusterStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], expiration: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !expiration.is_zero() {
            cmd.arg("PX").arg(expiration.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Opens cluster connections seeded with the configured node.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

impl RedisConnector {
    fn builder(config: &CacheConfig) -> ClusterClientBuilder {
        let seed = format!("redis://{}", config.address());
        let mut builder = ClusterClientBuilder::new(vec![seed])
            .response_timeout(Duration::from_millis(config.response_timeout_ms));
        if config.max_redirects > 0 {
            builder = builder.retries(config.max_redirects);
        }
        if !config.password.is_empty() {
            builder = builder.password(config.password.clone());
        }
        builder
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, config: &CacheConfig) -> Result<Box<dyn KvStore>, StoreError> {
        let client = Self::builder(config)
            .build()
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        let conn = client.get_async_connection().await?;
        Ok(Box::new(RedisClusterStore { conn }))
    }
}
