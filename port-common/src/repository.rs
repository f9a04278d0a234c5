use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Enumeration of errors for operations on a Repository.
/// NotFound is a distinguished outcome of `get` used by callers to decide between creating and
/// updating a record, every other variant is a real failure of the storage backend.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("object with key {key} not found")]
    NotFound { key: String },
    #[error("{operation} failed for key {key}: {error}")]
    Storage {
        operation: &'static str,
        key: String,
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RepositoryError {
    pub fn not_found(key: &str) -> Self {
        RepositoryError::NotFound {
            key: key.to_owned(),
        }
    }

    pub fn storage<E>(operation: &'static str, key: &str, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        RepositoryError::Storage {
            operation,
            key: key.to_owned(),
            error: error.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// A key-value store of records.
///
/// Implementations own their synchronization: concurrent calls on distinct keys must be safe to
/// interleave, and calls on the same key must be serialized by the implementation itself.
#[async_trait]
pub trait Repository: Send + Sync {
    type Record: Send;

    /// Fetch the record stored under `key`, or `RepositoryError::NotFound` if there is none.
    async fn get(&self, key: &str) -> RepositoryResult<Self::Record>;

    /// Store a record under a key that was not found.
    async fn create(&self, key: &str, record: Self::Record) -> RepositoryResult<()>;

    /// Replace the record stored under an existing key.
    async fn update(&self, key: &str, record: Self::Record) -> RepositoryResult<()>;

    /// Return a snapshot of every stored record.
    async fn list_all(&self) -> RepositoryResult<HashMap<String, Self::Record>>;
}

/// A Repository backed by an in-process map guarded by a read/write lock.
pub struct MemoryRepository<R> {
    storage: RwLock<HashMap<String, R>>,
}

impl<R> MemoryRepository<R> {
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }
}

impl<R> Default for MemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> Repository for MemoryRepository<R>
where
    R: Clone + Send + Sync,
{
    type Record = R;

    async fn get(&self, key: &str) -> RepositoryResult<R> {
        let storage = self.storage.read().await;

        storage
            .get(key)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(key))
    }

    async fn create(&self, key: &str, record: R) -> RepositoryResult<()> {
        self.storage.write().await.insert(key.to_owned(), record);

        Ok(())
    }

    async fn update(&self, key: &str, record: R) -> RepositoryResult<()> {
        self.storage.write().await.insert(key.to_owned(), record);

        Ok(())
    }

    async fn list_all(&self) -> RepositoryResult<HashMap<String, R>> {
        Ok(self.storage.read().await.clone())
    }
}
