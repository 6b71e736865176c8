//! Key/value cache store with TTL.
//!
//! The trait is the pipeline's only view of caching; the in-memory
//! implementation keeps whole entries behind one `RwLock` with lazy expiry on
//! read plus an explicit `sweep`. Entries are written wholesale after a
//! complete, successful computation, so no read-modify-write is ever needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;

use crate::error::VizError;

/// One cached query result: the frame plus the generated query text.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub df: DataFrame,
    pub query: String,
    pub cached_at: DateTime<Utc>,
}

pub trait CacheStore: Send + Sync {
    /// A read failure is reported as `CacheRead`; callers degrade it to a
    /// miss rather than aborting.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, VizError>;
    fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>);
}

#[derive(Clone)]
struct Entry {
    value: CacheEntry,
    expires_at: Option<Instant>,
}

/// In-memory store guarded by a single `RwLock`.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    map: Arc<parking_lot::RwLock<HashMap<String, Entry>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.map.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let expired: Vec<String> = w
            .iter()
            .filter_map(|(k, v)| v.expires_at.map(|exp| (k.clone(), exp)))
            .filter(|(_, exp)| now >= *exp)
            .map(|(k, _)| k)
            .collect();
        let n = expired.len();
        for k in expired {
            w.remove(&k);
        }
        n
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, VizError> {
        {
            let r = self.map.read();
            match r.get(key) {
                None => return Ok(None),
                Some(ent) => {
                    let expired = ent.expires_at.map(|exp| Instant::now() >= exp).unwrap_or(false);
                    if !expired {
                        return Ok(Some(ent.value.clone()));
                    }
                }
            }
        }
        // Expired: evict under the write lock and report a miss.
        self.map.write().remove(key);
        Ok(None)
    }

    fn set(&self, key: &str, entry: CacheEntry, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.map.write().insert(key.to_string(), Entry { value: entry, expires_at });
    }
}
