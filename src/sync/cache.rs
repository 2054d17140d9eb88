//! Per-session fallback cache.
//!
//! Holds the last reconciled view in a size-bounded store so a session can
//! keep serving reads while the Ticket Store is unreachable. Never a source
//! of truth: entries older than the staleness bound read as absent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache quota exceeded: {needed} bytes needed, {quota} bytes available")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A value as stored, with its write time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Key-value capability the Sync Client writes through.
pub trait FallbackCache: Send + Sync {
    /// Fresh entry for `key`, or `None` if absent or stale.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `value` under `key`, evicting older entries as needed.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;
}

/// In-memory [`FallbackCache`] weighted by payload bytes.
pub struct MemoryCache {
    quota: usize,
    entries: Cache<String, CacheEntry>,
}

impl MemoryCache {
    pub const DEFAULT_QUOTA: usize = 5 * 1024 * 1024;
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

    pub fn new(quota: usize, max_age: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(quota as u64)
            .weigher(|_key: &String, entry: &CacheEntry| {
                u32::try_from(entry.bytes.len()).unwrap_or(u32::MAX)
            })
            // Plain LRU: a fresh write must never be refused admission.
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(max_age)
            .build();
        Self { quota, entries }
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.weighted_size()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUOTA, Self::DEFAULT_MAX_AGE)
    }
}

impl FallbackCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(key))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        if value.len() > self.quota {
            return Err(CacheError::QuotaExceeded {
                needed: value.len(),
                quota: self.quota,
            });
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                bytes: value,
                stored_at: Utc::now(),
            },
        );
        self.entries.run_pending_tasks();
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
        Ok(())
    }
}
