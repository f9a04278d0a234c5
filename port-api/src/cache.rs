use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use moka::future::Cache;
use tokio::sync::Mutex;

use port_common::repository::{Repository, RepositoryError};

const LIST_CACHE_HITS: &str = "port_list_cache_hits_total";
const LIST_CACHE_MISSES: &str = "port_list_cache_misses_total";

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("failed to list ports: {0}")]
    Repository(#[from] RepositoryError),
    #[error("failed to serialize ports: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialized listing responses keyed by request URI.
/// Cleared after every ingestion, since any run may have written to the repository.
#[derive(Clone)]
pub struct ListCache {
    cache: Cache<String, Bytes>,
    fetch_lock: Arc<Mutex<()>>,
}

impl ListCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder().time_to_live(ttl).max_capacity(64).build();

        Self {
            cache,
            fetch_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get_or_load<P>(&self, key: &str, repository: &P) -> Result<Bytes, ListError>
    where
        P: Repository + ?Sized,
        P::Record: serde::Serialize,
    {
        if let Some(body) = self.cache.get(key).await {
            metrics::counter!(LIST_CACHE_HITS).increment(1);
            return Ok(body);
        }

        let _lock = self.fetch_lock.lock().await;

        // Another request may have filled it while we waited.
        if let Some(body) = self.cache.get(key).await {
            metrics::counter!(LIST_CACHE_HITS).increment(1);
            return Ok(body);
        }

        metrics::counter!(LIST_CACHE_MISSES).increment(1);

        let ports = repository.list_all().await?;
        let body = Bytes::from(serde_json::to_vec(&ports)?);
        self.cache.insert(key.to_owned(), body.clone()).await;

        Ok(body)
    }

    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use port_common::port::Port;
    use port_common::repository::MemoryRepository;

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let repository = MemoryRepository::<Port>::new();
        let cache = ListCache::new(Duration::from_secs(60));

        let empty = cache.get_or_load("/ports", &repository).await.unwrap();
        assert_eq!(&empty[..], b"{}");

        repository
            .create("AEAJM", Port::default())
            .await
            .unwrap();
        let stale = cache.get_or_load("/ports", &repository).await.unwrap();
        assert_eq!(&stale[..], b"{}");

        cache.invalidate();
        let fresh = cache.get_or_load("/ports", &repository).await.unwrap();
        let ports: serde_json::Value = serde_json::from_slice(&fresh).unwrap();
        assert!(ports.get("AEAJM").is_some());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let repository = MemoryRepository::<Port>::new();
        let cache = ListCache::new(Duration::from_millis(50));

        cache.get_or_load("/ports", &repository).await.unwrap();
        repository
            .create("AEAJM", Port::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let body = cache.get_or_load("/ports", &repository).await.unwrap();
        assert_ne!(&body[..], b"{}");
    }
}
