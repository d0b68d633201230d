use crate::sql::{Sql, SqlError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Presented query results, kept for a fixed time.
///
/// Entries are keyed by the endpoint and the fully rendered query including
/// its bound values, so two requests share an entry only when they would run
/// the same query. Clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

struct CacheEntry {
    value: serde_json::Value,
    inserted_at: Instant,
}

impl QueryCache {
    /// A TTL of 0 disables caching: inserts are dropped and lookups miss.
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Cache key for the result of `sql` served by `endpoint`.
    pub fn key(endpoint: &str, sql: &Sql) -> Result<String, SqlError> {
        Ok(sql.build()?.cache_key(endpoint))
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if self.ttl.is_zero() {
            return None;
        }
        self.entries.lock().get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() > self.ttl {
                None
            } else {
                Some(entry.value.clone())
            }
        })
    }

    pub fn insert(&self, key: String, value: serde_json::Value) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
