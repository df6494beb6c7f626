//! TTL key/value cache for session and bookkeeping state.
//!
//! A miss is a normal answer (`Ok(None)`), not an error. Expired entries are
//! invisible immediately and physically removed by [`MemoryCache::evict_expired`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{StorageError, StorageResult};

pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<()>;
    fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Thread-safe in-process cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let Ok(mut map) = self.entries.lock() else {
            return 0;
        };
        let before = map.len();
        let now = Instant::now();
        map.retain(|_, (_, expires_at)| *expires_at > now);
        before - map.len()
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let map = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(match map.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            _ => None,
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        let mut map = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        map.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut map = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        map.remove(key);
        Ok(())
    }
}
