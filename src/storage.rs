use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ExtensionError, Result};

/// Host key-value service. One logical record per key, last writer wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// Generic Helper: Put
pub async fn put_typed<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value).map_err(|e| ExtensionError::Storage(e.to_string()))?;
    store.set(key, value).await
}

// Generic Helper: Get. A record that no longer fits `T` is a schema failure.
pub async fn get_typed<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|_| ExtensionError::SchemaValidationFailure(key.to_string())),
        None => Ok(None),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Sled-backed store. Values are kept as JSON so records stay readable by
/// the popup tooling.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A named tree inside the same database, used for the session scope.
    pub fn open_tree(&self, name: &str) -> Result<SledTreeStore> {
        Ok(SledTreeStore {
            tree: self.db.open_tree(name)?,
        })
    }
}

pub struct SledTreeStore {
    tree: sled::Tree,
}

fn decode(key: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|_| ExtensionError::SchemaValidationFailure(key.to_string()))
}

fn encode(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ExtensionError::Storage(e.to_string()))
}

fn collect_keys(iter: sled::Iter) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for item in iter {
        let (k, _) = item?;
        keys.push(String::from_utf8_lossy(&k).into_owned());
    }
    Ok(keys)
}

#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => decode(key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.db.insert(key.as_bytes(), encode(&value)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        collect_keys(self.db.scan_prefix(prefix.as_bytes()))
    }
}

#[async_trait]
impl KvStore for SledTreeStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.tree.get(key.as_bytes())? {
            Some(data) => decode(key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.tree.insert(key.as_bytes(), encode(&value)?)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        collect_keys(self.tree.scan_prefix(prefix.as_bytes()))
    }
}

/// Local and session scopes for the configured backend.
pub struct Stores {
    pub local: Arc<dyn KvStore>,
    pub session: Arc<dyn KvStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            local: Arc::new(MemoryStore::new()),
            session: Arc::new(MemoryStore::new()),
        }
    }

    pub fn open(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sled => {
                let local = SledStore::open(Path::new(&config.path))?;
                let session = local.open_tree("session")?;
                // The session scope never outlives the process.
                session.tree.clear()?;
                Ok(Self {
                    local: Arc::new(local),
                    session: Arc::new(session),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_prefix_keys() {
        let store = MemoryStore::new();
        store.set("account:0x02", json!({})).await.unwrap();
        store.set("account:0x01", json!({})).await.unwrap();
        store.set("authUrls", json!({})).await.unwrap();

        assert_eq!(store.keys("account:").await.unwrap(), vec!["account:0x01", "account:0x02"]);

        store.remove("account:0x01").await.unwrap();
        assert!(store.get("account:0x01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_typed_reports_schema_failure() {
        let store = MemoryStore::new();
        store.set("chainMetadata", json!("not a map")).await.unwrap();

        let res = get_typed::<HashMap<String, u32>>(&store, "chainMetadata").await;
        assert_eq!(res, Err(ExtensionError::SchemaValidationFailure("chainMetadata".into())));
    }

    #[tokio::test]
    async fn test_sled_store_persists_and_clears_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Sled,
            path: dir.path().join("db").to_string_lossy().into_owned(),
        };

        {
            let stores = Stores::open(&config).unwrap();
            stores.local.set("authUrls", json!({ "a": 1 })).await.unwrap();
            stores.session.set("password-cache", json!({})).await.unwrap();
        }

        let stores = Stores::open(&config).unwrap();
        assert_eq!(stores.local.get("authUrls").await.unwrap(), Some(json!({ "a": 1 })));
        assert!(stores.session.get("password-cache").await.unwrap().is_none());
    }
}
