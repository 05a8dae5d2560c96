//! Pluggable key-value backends.
//!
//! A backend only needs point reads and writes plus a way to enumerate keys
//! under a prefix at startup; ordered range scans are layered on top by the
//! adapter's in-process key index.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::StorageError;

/// The interface a key-value backend must provide.
///
/// Implementations are expected to be cheap to clone behind an `Arc` and safe
/// to call from many tasks at once.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Enumerates every key starting with `prefix`, in no particular order.
    ///
    /// Called once when the adapter opens, to rebuild its ordered index.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Releases the backend's resources. Further calls fail.
    async fn close(&self);

    /// Whether `err` indicates a lost connection (retryable) rather than a
    /// permanent backend failure.
    fn is_connection_error(&self, err: &StorageError) -> bool {
        matches!(err, StorageError::Connection { .. })
    }
}

/// In-memory backend used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    closed: bool,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, StorageError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_state(|s| s.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.with_state(|s| {
            s.entries.insert(key.to_string(), value);
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.with_state(|s| {
            s.entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_get_put() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("k").await.expect("get"), None);
        backend.put("k", b"v".to_vec()).await.expect("put");
        assert_eq!(backend.get("k").await.expect("get"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn closed_backend_rejects_calls() {
        let backend = MemoryBackend::new();
        backend.put("k", b"v".to_vec()).await.expect("put");
        backend.close().await;
        assert!(matches!(backend.get("k").await, Err(StorageError::Closed)));
        assert!(matches!(
            backend.put("k", b"v".to_vec()).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn prefix_enumeration() {
        let backend = MemoryBackend::new();
        backend.put("_KV_a", b"1".to_vec()).await.expect("put");
        backend.put("_KV_b", b"2".to_vec()).await.expect("put");
        backend.put("other", b"3".to_vec()).await.expect("put");

        let mut keys = backend.keys_with_prefix("_KV_").await.expect("keys");
        keys.sort();
        assert_eq!(keys, vec!["_KV_a".to_string(), "_KV_b".to_string()]);
    }
}
