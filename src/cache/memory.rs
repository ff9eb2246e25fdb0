//! In-process cache backend for local development and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Connector, KvStore, StoreError};
use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Every this many writes, expired entries are swept from the whole map.
pub const SWEEP_INTERVAL: usize = 256;

/// DashMap-backed store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], expiration: Duration) -> Result<(), StoreError> {
        let expires_at = if expiration.is_zero() {
            None
        } else {
            Some(Instant::now() + expiration)
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Hands out handles to one shared [`MemoryStore`], so data survives reconnects.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &CacheConfig) -> Result<Box<dyn KvStore>, StoreError> {
        Ok(Box::new(self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStore::new();
        store.set("a", b"1", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        store.del("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let store = MemoryStore::new();
        store.set("a", b"1", Duration::from_millis(20)).await.unwrap();
        store.set("b", b"2", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_keys_never_read_again() {
        let store = MemoryStore::new();
        for i in 0..10 {
            let key = format!("auth:token:{}", i);
            store.set(&key, b"id", Duration::from_millis(10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        for _ in 0..SWEEP_INTERVAL {
            store.set("live", b"1", Duration::ZERO).await.unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("live").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("a", b"1", Duration::from_millis(10)).await.unwrap();
        store.set("b", b"2", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_connector_shares_entries() {
        let connector = MemoryConnector::default();
        let config = CacheConfig::default();

        let first = connector.connect(&config).await.unwrap();
        first.set("k", b"v", Duration::ZERO).await.unwrap();

        let second = connector.connect(&config).await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(connector.store().len(), 1);
    }
}
