//! In-process store with TTL expiry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use super::Store;
use crate::error::Result;
use crate::ratelimit::{Clock, SystemClock};

/// A stored value and the instant it stops being visible.
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: f64,
}

impl Entry {
    fn is_live(&self, now: f64) -> bool {
        now < self.expires_at
    }
}

/// A concurrent in-memory store.
///
/// Expired entries are invisible to reads and are dropped lazily when touched
/// or in bulk by `purge_expired`.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires entries against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.entries.len());

        if purged > 0 {
            trace!(purged = purged, "Purged expired entries");
        }
        purged
    }

    /// All live entries, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|entry| entry.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }

        // The read guard is released above; removing while holding it deadlocks.
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            self.entries.remove(key);
            return Ok(());
        }

        let expires_at = self.clock.now() + ttl.as_secs_f64();
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry.is_live(now))
            .unwrap_or(false))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
