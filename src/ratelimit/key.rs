//! Bucket key parsing and handling.

use crate::error::{Result, SluiceError};

/// Separator between the parent scope and the rest of a compound key.
pub const KEY_SEPARATOR: char = ':';

/// Suffix appended to a bucket key to form its timeout key.
const TIMEOUT_SUFFIX: &str = "timeout";

/// A key that identifies a bucket in the store.
///
/// Keys containing a `:` are compound: the text before the first `:` names
/// a parent scope shared by every key with that prefix. Only the first
/// separator is significant, so `a:b:c` has parent `a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    key: String,
}

impl BucketKey {
    /// Parse a bucket key, rejecting empty keys.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(SluiceError::Config("bucket key must not be empty".to_string()));
        }
        Ok(Self { key })
    }

    /// The full key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Whether the key has a parent scope.
    pub fn is_compound(&self) -> bool {
        self.parent().is_some()
    }

    /// The parent scope of a compound key.
    pub fn parent(&self) -> Option<&str> {
        self.key
            .split_once(KEY_SEPARATOR)
            .map(|(parent, _)| parent)
            .filter(|parent| !parent.is_empty())
    }

    /// The key under which this bucket's timeout is stored.
    pub fn timeout_key(&self) -> String {
        timeout_key(&self.key)
    }
}

/// The timeout key for any bucket key.
pub fn timeout_key(key: &str) -> String {
    format!("{}{}{}", key, KEY_SEPARATOR, TIMEOUT_SUFFIX)
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}
