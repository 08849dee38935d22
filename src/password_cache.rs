//! Session-scoped cache of unlock passwords.
//!
//! The whole cache lives under one namespace key as a map
//! `address -> { password, expiresAt }`. Reads validate the stored shape and
//! treat anything unexpected as an empty cache. Entries are never evicted
//! here; callers compare `expires_at` against the clock themselves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::storage::KvStore;

pub const PASSWORD_CACHE_NAMESPACE: &str = "password-cache";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CachedPassword {
    pub password: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
}

impl CachedPassword {
    pub fn new(password: String, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            password,
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }
}

type Namespace = HashMap<String, CachedPassword>;

#[derive(Clone)]
pub struct PasswordCache {
    store: Arc<dyn KvStore>,
}

impl PasswordCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Parse-or-absent read of the whole namespace.
    async fn load(&self) -> Option<Namespace> {
        let raw = match self.store.get(PASSWORD_CACHE_NAMESPACE).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!("password cache unreadable, treating as empty: {}", e);
                return None;
            }
        };
        match serde_json::from_value::<Namespace>(raw) {
            Ok(ns) => Some(ns),
            Err(e) => {
                debug!("password cache failed schema validation: {}", e);
                None
            }
        }
    }

    async fn update<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(Namespace) -> Namespace,
    {
        let current = self.load().await.unwrap_or_default();
        let next = serde_json::to_value(updater(current))
            .map_err(|e| crate::error::ExtensionError::Storage(e.to_string()))?;
        self.store.set(PASSWORD_CACHE_NAMESPACE, next).await
    }

    pub async fn get(&self, address: &str) -> Option<CachedPassword> {
        self.load().await.and_then(|mut ns| ns.remove(address))
    }

    pub async fn set(&self, address: &str, entry: CachedPassword) -> Result<()> {
        let address = address.to_string();
        self.update(move |mut ns| {
            ns.insert(address, entry);
            ns
        })
        .await
    }

    pub async fn remove(&self, address: &str) -> Result<()> {
        self.update(|mut ns| {
            ns.remove(address);
            ns
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(PASSWORD_CACHE_NAMESPACE).await
    }
}
