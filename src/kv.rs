//! Pluggable key-value storage abstraction
//!
//! The federation engine uses a [`KvStore`] for small pieces of state that
//! need to survive across requests and, in a multi-process deployment,
//! across processes: cached remote documents, idempotence markers for
//! inbox activities, and signature verification caches. Host applications
//! are expected to provide a real backend (Redis, Postgres, ...); this
//! crate ships an in-memory implementation for tests and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// A key in the key-value store. Keys are a sequence of segments joined by
/// the store; callers build them with [`kv_key`].
pub type Key = Vec<String>;

/// Build a [`Key`] from string-like segments.
#[macro_export]
macro_rules! kv_key {
    ($($seg:expr),+ $(,)?) => {
        vec![$($seg.to_string()),+]
    };
}

/// Pluggable key-value storage abstraction used for caches and idempotence
/// markers. Implementations must be safe to share across threads.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`, if any.
    async fn get(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`. If `ttl` is set, the entry may be dropped
    /// by the store once the TTL elapses; implementations are not required
    /// to enforce this precisely but must not serve stale-but-expired data
    /// indefinitely.
    async fn set(&self, key: Key, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Remove any value stored under `key`.
    async fn delete(&self, key: &Key) -> anyhow::Result<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Simple in-process [`KvStore`] backed by a `Mutex<HashMap>`. Entries past
/// their TTL are evicted lazily, on the next access to that key.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryKvStore {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &Key) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().expect("kv store mutex poisoned");
        if let Some(entry) = entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if expires_at <= Instant::now() {
                    entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: Key, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.lock().expect("kv store mutex poisoned");
        entries.insert(key, Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &Key) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().expect("kv store mutex poisoned");
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemoryKvStore::new();
        store.set(kv_key!["_fedi", "doc", "a"], b"hello".to_vec(), None).await.unwrap();
        let value = store.get(&kv_key!["_fedi", "doc", "a"]).await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = MemoryKvStore::new();
        let value = store.get(&kv_key!["_fedi", "doc", "missing"]).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryKvStore::new();
        store.set(kv_key!["_fedi", "doc", "a"], b"hello".to_vec(), None).await.unwrap();
        store.delete(&kv_key!["_fedi", "doc", "a"]).await.unwrap();
        let value = store.get(&kv_key!["_fedi", "doc", "a"]).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn expired_entry_is_evicted() {
        let store = MemoryKvStore::new();
        store
            .set(kv_key!["_fedi", "doc", "a"], b"hello".to_vec(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let value = store.get(&kv_key!["_fedi", "doc", "a"]).await.unwrap();
        assert_eq!(value, None);
    }
}
