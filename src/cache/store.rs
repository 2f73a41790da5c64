//! Cache store adapter.
//!
//! The store is the shared key/value cache the edge server reads from. The core only needs
//! key-granular get, set-with-TTL, delete and delete-many; nothing here is transactional
//! across keys.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store operation timed out")]
    Timeout,
    #[error("cache store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Key/value store holding rendered pages.
///
/// Implementations must be safe to share across request handlers. Callers treat every
/// error as a cache miss (reads) or an already-applied operation (writes, deletes).
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError>;
}

#[derive(Clone)]
struct StoredEntry {
    body: Bytes,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// In-process LRU store with per-entry expiry.
///
/// Useful for single-node deployments and tests; entries past their TTL are treated as
/// absent and dropped on the next access.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, StoredEntry>>,
}

impl MemoryStore {
    /// Create a new memory store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.memory_store_limit_non_zero())),
        }
    }

    /// Get the number of stored entries, including ones that expired but were not yet touched.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries.
    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let now = Instant::now();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.body.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let entry = StoredEntry {
            body: value,
            expires_at: Instant::now().checked_add(ttl),
        };
        rw_write(&self.entries, SOURCE, "set").put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_many");
        for key in keys {
            entries.pop(key.as_str());
        }
        Ok(())
    }
}
