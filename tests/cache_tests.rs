/// Reconnect behaviour of the cache client against a backend that times out
use async_trait::async_trait;
use lake_gateway::{
    cache::{CacheClient, CacheError, Connector, KvStore, MemoryStore, StoreError},
    config::CacheConfig,
    context::RequestContext,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// Backend whose connections time out until `healthy` is set.
struct TimingOutBackend {
    data: MemoryStore,
    healthy: Arc<AtomicBool>,
    connects: AtomicUsize,
    /// Handed to the first connection only: its callers wait for each other before failing
    first_gate: Mutex<Option<Arc<Barrier>>>,
}

struct Handle {
    data: MemoryStore,
    healthy: Arc<AtomicBool>,
    gate: Option<Arc<Barrier>>,
}

impl Handle {
    async fn check(&self) -> Result<(), StoreError> {
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Timeout("read tcp 10.0.0.7:6379".to_string()))
        }
    }
}

#[async_trait]
impl KvStore for Handle {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check().await?;
        self.data.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], expiration: Duration) -> Result<(), StoreError> {
        self.check().await?;
        self.data.set(key, value, expiration).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check().await?;
        self.data.del(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl Connector for TimingOutBackend {
    async fn connect(&self, _config: &CacheConfig) -> Result<Box<dyn KvStore>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.first_gate.lock().unwrap().take();
        Ok(Box::new(Handle {
            data: self.data.clone(),
            healthy: Arc::clone(&self.healthy),
            gate,
        }))
    }
}

fn backend(healthy: bool) -> Arc<TimingOutBackend> {
    gated_backend(healthy, None)
}

fn gated_backend(healthy: bool, gate: Option<Arc<Barrier>>) -> Arc<TimingOutBackend> {
    Arc::new(TimingOutBackend {
        data: MemoryStore::new(),
        healthy: Arc::new(AtomicBool::new(healthy)),
        connects: AtomicUsize::new(0),
        first_gate: Mutex::new(gate),
    })
}

#[tokio::test]
async fn test_persistent_timeout_surfaces_after_one_reconnect() {
    let backend = backend(false);
    let cache = CacheClient::connect(CacheConfig::default(), backend.clone())
        .await
        .unwrap();
    let ctx = RequestContext::with_stan("it-1");

    let err = cache.get::<String>(&ctx, "k").await.unwrap_err();
    assert!(matches!(err, CacheError::Store(ref e) if e.is_io_timeout()));
    assert_eq!(backend.connects.load(Ordering::SeqCst), 2);

    let err = cache
        .set(&ctx, "k", Duration::ZERO, "v")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert_eq!(backend.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_recovered_backend_serves_values() {
    let backend = backend(true);
    let cache = CacheClient::connect(CacheConfig::default(), backend.clone())
        .await
        .unwrap();
    let ctx = RequestContext::with_stan("it-2");

    cache
        .set(&ctx, "greeting", Duration::from_secs(60), "hello")
        .await
        .unwrap();

    let value: Option<String> = cache.get(&ctx, "greeting").await.unwrap();
    assert_eq!(value.as_deref(), Some("hello"));

    cache.refresh(&ctx).await.unwrap();
    assert_eq!(cache.generation(), 1);

    let value: Option<String> = cache.get(&ctx, "greeting").await.unwrap();
    assert_eq!(value.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_concurrent_callers_share_reconnects() {
    const CALLERS: usize = 8;
    let backend = gated_backend(false, Some(Arc::new(Barrier::new(CALLERS))));
    let cache = Arc::new(
        CacheClient::connect(CacheConfig::default(), backend.clone())
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..CALLERS {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            let ctx = RequestContext::with_stan(format!("it-3-{}", i));
            cache.get::<String>(&ctx, "k").await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    // all callers failed on the first connection; only one of them dialled again
    assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    assert_eq!(cache.generation(), 1);
}
