//! # Meridian Storage
//!
//! Persistence for entity attribute blobs. The actual key-value store is a
//! pluggable backend behind the [`KvBackend`] trait; this crate supplies the
//! adapter ([`KvStore`]) that owns the fixed key prefix, keeps an in-process
//! ordered index of known keys (so range queries work even when the backend
//! has no native ordered scan), and implements the retry policy for
//! connection failures.
//!
//! Storage failures never block entity execution: a save that keeps failing
//! after backoff is deferred and picked up again on a later tick.

pub mod backend;
pub mod store;

pub use backend::{KvBackend, MemoryBackend};
pub use store::{KvItem, KvIter, KvStore, StorageError, KEY_PREFIX, STORAGE_RETRY_CAP};
