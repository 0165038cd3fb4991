//! Persistence for bucket state.
//!
//! The limiter only needs four operations from its store. Any cache that can
//! hold JSON values with a time-to-live can back it; `MemoryStore` is the
//! in-process implementation.

mod memory;

use std::time::Duration;

use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryStore;

/// Key-value storage with per-entry expiry.
///
/// Reads and writes are independent: a `get` followed by a `put` is not
/// atomic, so limiters sharing a store may race on the same key.
pub trait Store: Send + Sync {
    /// Fetch a live value.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value that expires after `ttl`. A zero TTL removes the key.
    fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Whether a live value exists.
    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove a value, returning whether the store accepted the removal.
    fn forget(&self, key: &str) -> Result<bool>;
}
