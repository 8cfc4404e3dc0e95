//! Result store abstraction
//!
//! The engine persists execution status and sandbox storage writes into a
//! key-value store with per-key expiry. In production this is an external
//! store; `InMemoryResultStore` is the bundled implementation used by default
//! and in tests. Key namespaces are disjoint by construction (`exec:{id}` for
//! status, `data:{tenant}:{key}` for the storage capability), so the design
//! relies on single-writer-per-key discipline rather than cross-component
//! locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::EngineError;

/// Key prefix for execution status records.
pub fn status_key(id: &uuid::Uuid) -> String {
    format!("exec:{}", id)
}

/// Key prefix for the storage capability of one tenant.
pub fn data_prefix(tenant: &str) -> String {
    format!("data:{}:", tenant)
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Fetch a live value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    /// Write a value with an expiry. `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), EngineError>;

    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// List live keys under a prefix.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, EngineError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-memory store with lazy expiry: dead entries are dropped when touched
/// by a read or overwritten, not by a background sweeper.
pub struct InMemoryResultStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.expired(now) {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), EngineError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let store = InMemoryResultStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_not_found() {
        let store = InMemoryResultStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.list_prefix("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_prefix_is_namespace_scoped() {
        let store = InMemoryResultStore::new();
        store
            .set("data:a:x", "1".to_string(), None)
            .await
            .unwrap();
        store
            .set("data:a:y", "2".to_string(), None)
            .await
            .unwrap();
        store
            .set("data:b:x", "3".to_string(), None)
            .await
            .unwrap();
        let keys = store.list_prefix("data:a:").await.unwrap();
        assert_eq!(keys, vec!["data:a:x".to_string(), "data:a:y".to_string()]);
    }
}
