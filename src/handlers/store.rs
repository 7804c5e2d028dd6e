use crate::config::{StoreBackend, StoreConfig};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sled::Db;
use std::path::Path;
use std::sync::Arc;

/// JSON documents grouped in collections, keyed by id.
///
/// `put` overwrites, so replaying the same write is harmless.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Build the configured store
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.backend {
        StoreBackend::Sled => Ok(Arc::new(SledDocumentStore::new(&config.path)?)),
        StoreBackend::Memory => Ok(Arc::new(InMemoryDocumentStore::new())),
    }
}

/// Persistent document store using Sled embedded database, one tree per collection
#[derive(Clone)]
pub struct SledDocumentStore {
    db: Arc<Db>,
}

impl SledDocumentStore {
    /// Create a new Sled store at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            AppError::Storage(format!("Failed to open Sled database: {}", e))
        })?;

        tracing::info!("Initialized Sled document store at {:?}", path.as_ref());

        Ok(Self { db: Arc::new(db) })
    }

    fn tree(&self, collection: &str) -> Result<sled::Tree> {
        self.db.open_tree(collection).map_err(|e| {
            AppError::Storage(format!("Failed to open tree {}: {}", collection, e))
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SledDocumentStore {
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        self.tree(collection)?.insert(id.as_bytes(), bytes)?;
        tracing::debug!(collection, id, "Document saved");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        match self.tree(collection)?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.tree(collection)?.len())
    }
}

/// In-memory document store (for dry runs and testing)
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<DashMap<(String, String), Value>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<()> {
        self.documents
            .insert((collection.to_string(), id.to_string()), document.clone());
        tracing::debug!(collection, id, "Document saved");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sled_put_get() {
        let dir = TempDir::new().unwrap();
        let store = SledDocumentStore::new(dir.path()).unwrap();

        store.put("orders", "evt-1", &json!({"order_id": "O-1"})).await.unwrap();
        store.put("orders", "evt-1", &json!({"order_id": "O-1"})).await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(store.count("orders").await.unwrap(), 1);
        assert_eq!(
            store.get("orders", "evt-1").await.unwrap(),
            Some(json!({"order_id": "O-1"}))
        );
        assert_eq!(store.get("orders", "evt-2").await.unwrap(), None);
        assert_eq!(store.count("customers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_collections_are_separate() {
        let store = InMemoryDocumentStore::new();

        store.put("products", "a", &json!(1)).await.unwrap();
        store.put("orders", "a", &json!(2)).await.unwrap();

        assert_eq!(store.count("products").await.unwrap(), 1);
        assert_eq!(store.get("orders", "a").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_build_store_memory() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..StoreConfig::default()
        };
        let store = build_store(&config).unwrap();
        assert_eq!(store.count("anything").await.unwrap(), 0);
    }
}
