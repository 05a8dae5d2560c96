//! The keyspace adapter.
//!
//! [`KvStore`] owns the fixed key prefix, mirrors the set of known keys into
//! an in-process ordered index (`BTreeSet`), and serves range queries from
//! that index; the backend only ever sees point reads and writes. A key
//! enters the index when its `put` succeeds.
//!
//! Connection errors are retryable: [`KvStore::put_with_retry`] backs off
//! exponentially up to [`STORAGE_RETRY_CAP`] attempts, after which the caller
//! defers the save to a later tick.

use std::collections::{BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::KvBackend;

/// Prefix under which all adapter-managed keys live.
pub const KEY_PREFIX: &str = "_KV_";

/// Maximum number of attempts for a retryable write.
pub const STORAGE_RETRY_CAP: u32 = 5;

/// Base delay for the exponential backoff between attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend connection is down; the operation may be retried.
    #[error("storage connection error: {detail}")]
    Connection {
        /// Backend-specific description.
        detail: String,
    },

    /// The backend rejected the operation permanently.
    #[error("storage backend error: {detail}")]
    Backend {
        /// Backend-specific description.
        detail: String,
    },

    /// The backend has been closed.
    #[error("storage backend closed")]
    Closed,

    /// All retry attempts were exhausted; the save must be deferred.
    #[error("storage retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

impl StorageError {
    /// Whether the operation may be retried or deferred rather than failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Connection { .. } | StorageError::RetriesExhausted { .. }
        )
    }
}

/// One key-value pair yielded by a range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvItem {
    pub key: String,
    pub value: Vec<u8>,
}

/// The keyspace adapter over a pluggable backend.
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    index: Mutex<BTreeSet<String>>,
}

impl KvStore {
    /// Opens the adapter, rebuilding the key index from the backend.
    pub async fn open(backend: Arc<dyn KvBackend>) -> Result<Self, StorageError> {
        let mut index = BTreeSet::new();
        for key in backend.keys_with_prefix(KEY_PREFIX).await? {
            index.insert(key[KEY_PREFIX.len()..].to_string());
        }
        debug!(keys = index.len(), "kv store opened");
        Ok(Self {
            backend,
            index: Mutex::new(index),
        })
    }

    /// Reads the value stored under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.backend.get(&prefixed(key)).await
    }

    /// Writes `value` under `key`.
    ///
    /// The key joins the ordered index only after the backend reports
    /// success, so a failed write never pollutes range queries.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.backend.put(&prefixed(key), value).await?;
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
        Ok(())
    }

    /// Writes `value` under `key`, retrying connection errors with
    /// exponential backoff.
    ///
    /// Gives up after [`STORAGE_RETRY_CAP`] attempts with
    /// [`StorageError::RetriesExhausted`]; the caller then defers the save.
    /// Non-connection errors are returned immediately.
    pub async fn put_with_retry(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=STORAGE_RETRY_CAP {
            match self.put(key, value.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if self.backend.is_connection_error(&err) => {
                    warn!(key, attempt, %err, "storage put failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(StorageError::RetriesExhausted {
            attempts: STORAGE_RETRY_CAP,
        })
    }

    /// Returns an ordered iterator over keys in `[begin, end)`.
    ///
    /// Served from the in-process index; values are fetched lazily from the
    /// backend as the iterator advances.
    pub fn find(&self, begin: &str, end: &str) -> KvIter {
        let keys: VecDeque<String> = self
            .index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .range::<str, _>((Bound::Included(begin), Bound::Excluded(end)))
            .cloned()
            .collect();
        KvIter {
            backend: Arc::clone(&self.backend),
            keys,
        }
    }

    /// Whether `err` is a backend connection error.
    pub fn is_connection_error(&self, err: &StorageError) -> bool {
        self.backend.is_connection_error(err)
    }

    /// Closes the underlying backend.
    pub async fn close(&self) {
        self.backend.close().await;
    }
}

/// Ordered iterator over a key range.
pub struct KvIter {
    backend: Arc<dyn KvBackend>,
    keys: VecDeque<String>,
}

impl KvIter {
    /// Yields the next item, or `None` when the range is exhausted.
    pub async fn next(&mut self) -> Option<Result<KvItem, StorageError>> {
        let key = self.keys.pop_front()?;
        match self.backend.get(&prefixed(&key)).await {
            Ok(Some(value)) => Some(Ok(KvItem { key, value })),
            // Deleted between index snapshot and fetch; skip silently.
            Ok(None) => Box::pin(self.next()).await,
            Err(err) => Some(Err(err)),
        }
    }
}

fn prefixed(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend wrapper that fails the next N puts with a connection error.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_puts: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_puts: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
            let remaining = self.fail_puts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_puts.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Connection {
                    detail: "injected drop".into(),
                });
            }
            self.inner.put(key, value).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.keys_with_prefix(prefix).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    #[tokio::test]
    async fn put_get_find_roundtrip() {
        let store = KvStore::open(Arc::new(MemoryBackend::new())).await.expect("open");
        store.put("k", b"v".to_vec()).await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v".to_vec()));

        let mut iter = store.find("a", "z");
        let item = iter.next().await.expect("item").expect("ok");
        assert_eq!(item.key, "k");
        assert_eq!(item.value, b"v");
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn find_is_ordered_and_range_bounded() {
        let store = KvStore::open(Arc::new(MemoryBackend::new())).await.expect("open");
        for key in ["delta", "alpha", "omega", "charlie"] {
            store.put(key, key.as_bytes().to_vec()).await.expect("put");
        }

        let mut iter = store.find("alpha", "omega");
        let mut seen = Vec::new();
        while let Some(item) = iter.next().await {
            seen.push(item.expect("ok").key);
        }
        // End bound excluded, output in key order.
        assert_eq!(seen, vec!["alpha", "charlie", "delta"]);
    }

    #[tokio::test]
    async fn failed_put_does_not_enter_index() {
        let store = KvStore::open(Arc::new(FlakyBackend::new(1))).await.expect("open");
        let err = store.put("k", b"v".to_vec()).await.unwrap_err();
        assert!(err.is_retryable());

        let mut iter = store.find("a", "z");
        assert!(iter.next().await.is_none(), "failed key must not be indexed");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_connection_drop() {
        let store = KvStore::open(Arc::new(FlakyBackend::new(2))).await.expect("open");
        store.put_with_retry("k", b"v".to_vec()).await.expect("retried put");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v".to_vec()));

        let mut iter = store.find("a", "z");
        let item = iter.next().await.expect("item").expect("ok");
        assert_eq!(item.key, "k");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_cap() {
        let store = KvStore::open(Arc::new(FlakyBackend::new(u32::MAX))).await.expect("open");
        let err = store.put_with_retry("k", b"v".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::RetriesExhausted {
                attempts: STORAGE_RETRY_CAP
            }
        ));
        assert!(err.is_retryable(), "exhausted retries defer, not fail");
    }

    #[tokio::test]
    async fn index_rebuilt_on_open() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = KvStore::open(Arc::clone(&backend) as Arc<dyn KvBackend>)
                .await
                .expect("open");
            store.put("persisted", b"x".to_vec()).await.expect("put");
        }
        let reopened = KvStore::open(backend).await.expect("reopen");
        let mut iter = reopened.find("a", "z");
        let item = iter.next().await.expect("item").expect("ok");
        assert_eq!(item.key, "persisted");
    }
}
