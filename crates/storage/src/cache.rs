//! TTL Cache

use crate::StorageError;
use alert_model::{after, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Entries are swept of expired keys once per this many writes
const PURGE_EVERY_WRITES: u64 = 1024;

/// Key-value cache with per-entry expiry.
///
/// Values are opaque bytes so any key-value store can back it.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a live value; `Ok(None)` on miss or expiry
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value with the backend's default TTL
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Store a value that expires after `ttl`
    async fn set_for(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

struct Entries {
    map: HashMap<String, Entry>,
    writes: u64,
}

/// In-process cache backend
pub struct MemoryCache {
    entries: Mutex<Entries>,
    /// TTL used by `set`
    default_ttl: Duration,
    clock: SharedClock,
}

impl MemoryCache {
    /// Create a new in-memory cache
    pub fn new(default_ttl: Duration, clock: SharedClock) -> Self {
        info!("Creating in-memory cache (default ttl {:?})", default_ttl);
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                writes: 0,
            }),
            default_ttl,
            clock,
        }
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        let now = self.clock.now();
        match entries.map.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.set_for(key, value, self.default_ttl).await
    }

    async fn set_for(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::BackendError(format!("Lock error: {}", e)))?;

        let now = self.clock.now();
        entries.writes += 1;
        if entries.writes % PURGE_EVERY_WRITES == 0 {
            let before = entries.map.len();
            entries.map.retain(|_, entry| entry.expires_at > now);
            debug!("Purged {} expired cache entries", before - entries.map.len());
        }

        entries.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: after(now, ttl),
            },
        );
        Ok(())
    }
}
