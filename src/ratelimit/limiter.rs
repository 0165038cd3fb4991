//! Hierarchical leaky-bucket limiter.
//!
//! A limiter owns the bucket for one key and, when the key is compound
//! (`parent:rest`), a second bucket for the parent scope. Every limiter built
//! from a key with the same prefix shares that parent through the store, so a
//! saturated parent throttles all of its children.
//!
//! Bucket state lives in the store between calls. Each record is written with
//! a TTL equal to the bucket's drain time, so idle buckets disappear on their
//! own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketSettings, Mutation, Veto};
use super::key::{timeout_key, BucketKey};
use super::resolver::{validate_resolver, Resolver};
use crate::error::{Result, SluiceError};
use crate::store::Store;

/// Result of a single admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The hit was recorded
    Admitted { limit: u64, remaining: u64 },
    /// A notification sink refused the hit for at least one bucket
    Vetoed {
        limit: u64,
        remaining: u64,
        veto: Veto,
    },
    /// The limit is exceeded or a timeout is active; nothing was recorded
    Throttled {
        limit: u64,
        remaining: u64,
        /// Seconds until the timeout expires
        backoff: u64,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// A leaky-bucket rate limiter over a shared store.
pub struct Limiter<B: Bucket> {
    /// Bucket for the prefix of a compound key
    parent: Option<B>,
    /// Bucket for the full key; all reporting reads this one
    leaf: B,
    store: Arc<dyn Store>,
}

impl<B: Bucket> Limiter<B> {
    /// Build a limiter around `bucket`, restoring any persisted state.
    ///
    /// Nothing is written to the store until the first `hit`.
    pub fn new(store: Arc<dyn Store>, mut bucket: B) -> Result<Self> {
        let defaults = BucketSettings::from(&bucket.to_record());
        let key = BucketKey::new(bucket.key())?;

        let parent = match key.parent() {
            Some(prefix) => {
                let mut parent = bucket.sibling(prefix, bucket.max(), bucket.rate())?;
                let settings = load_settings(store.as_ref(), prefix)?.unwrap_or(defaults);
                parent.configure(&settings)?;
                Some(parent)
            }
            None => None,
        };

        let settings = load_settings(store.as_ref(), key.as_str())?.unwrap_or(defaults);
        bucket.configure(&settings)?;

        debug!(
            key = %key,
            parent = ?key.parent(),
            drips = bucket.drips(),
            "Limiter initialized"
        );

        Ok(Self {
            parent,
            leaf: bucket,
            store,
        })
    }

    /// Point the limiter at a new key and limits.
    ///
    /// Only the leaf bucket changes. When the key changes, the old leaf's
    /// record is dropped from the store; the parent is never touched.
    pub fn configure(&mut self, key: &str, max: u64, rate: f64) -> Result<&mut Self> {
        BucketKey::new(key)?;
        let mut leaf = self.leaf.sibling(key, max, rate)?;
        let rotating = self.leaf.key() != key;

        // A rotated leaf starts empty, as if reset now.
        let mut settings = if rotating {
            BucketSettings {
                drips: Some(0),
                timer: Some(self.leaf.clock().now()),
                ..Default::default()
            }
        } else {
            BucketSettings {
                drips: Some(i64::try_from(self.leaf.drips()).unwrap_or(i64::MAX)),
                timer: Some(self.leaf.timer()),
                ..Default::default()
            }
        };
        if let Some(existing) = load_settings(self.store.as_ref(), key)? {
            settings = settings.merge(existing);
        }
        settings.max = Some(max);
        settings.rate = Some(rate);

        // The old leaf is only dropped once the new one is configured.
        leaf.configure(&settings)?;

        if rotating {
            debug!(from = %self.leaf.key(), to = %key, "Rotating limiter key");
            self.store.forget(self.leaf.key())?;
        }
        self.leaf = leaf;

        Ok(self)
    }

    /// Configure the limiter from a resolver.
    pub fn resolve(&mut self, resolver: &dyn Resolver) -> Result<&mut Self> {
        validate_resolver(resolver)?;
        self.configure(&resolver.key(), resolver.max(), resolver.rate())
    }

    /// Whether the next hit should be refused.
    ///
    /// True while a timeout is active, or when any bucket in the hierarchy is
    /// full after decay.
    pub fn exceeded(&mut self) -> Result<bool> {
        if self.has_timeout()? {
            trace!(key = %self.leaf.key(), "Limiter timed out");
            return Ok(true);
        }

        let mut exceeded = false;
        for bucket in self.parent.iter_mut().chain(std::iter::once(&mut self.leaf)) {
            if let Mutation::Vetoed(veto) = bucket.leak(None) {
                debug!(key = %bucket.key(), reason = %veto.reason, "Leak vetoed");
            }
            trace!(
                key = %bucket.key(),
                drips = bucket.drips(),
                max = bucket.max(),
                "Checking bucket"
            );
            if bucket.is_full() {
                debug!(key = %bucket.key(), max = bucket.max(), "Rate limit exceeded");
                exceeded = true;
            }
        }

        Ok(exceeded)
    }

    /// Whether a timeout is active for any bucket in the hierarchy.
    pub fn has_timeout(&self) -> Result<bool> {
        for bucket in self.buckets() {
            if self.store.has(&timeout_key(bucket.key()))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lock the limiter out for `duration` seconds.
    ///
    /// Does nothing while a timeout is already active, so the first caller
    /// decides the expiry.
    pub fn timeout(&mut self, duration: u64) -> Result<()> {
        if self.has_timeout()? {
            return Ok(());
        }

        let until = (self.leaf.timer().floor() as i64)
            .saturating_add(i64::try_from(duration).unwrap_or(i64::MAX));
        debug!(key = %self.leaf.key(), duration = duration, until = until, "Timing out limiter");

        self.store.put(
            &timeout_key(self.leaf.key()),
            Value::from(until),
            Duration::from_secs(duration),
        )
    }

    /// Record one hit against every bucket and persist them.
    ///
    /// Returns the leaf bucket's drip count. Use [`Limiter::record`] to see
    /// whether a sink vetoed the hit.
    pub fn hit(&mut self) -> Result<u64> {
        let _ = self.record()?;
        Ok(self.leaf.drips())
    }

    /// Fill every bucket by one and persist them.
    ///
    /// Returns the first veto raised by any bucket. Vetoed buckets are
    /// persisted unchanged.
    pub fn record(&mut self) -> Result<Mutation> {
        let store = Arc::clone(&self.store);
        let mut outcome = Mutation::Applied;
        for bucket in self.parent.iter_mut().chain(std::iter::once(&mut self.leaf)) {
            if let Mutation::Vetoed(veto) = bucket.fill(1) {
                debug!(key = %bucket.key(), reason = %veto.reason, "Fill vetoed");
                if outcome.is_applied() {
                    outcome = Mutation::Vetoed(veto);
                }
            }
            persist(store.as_ref(), bucket)?;
        }

        Ok(outcome)
    }

    /// Try to admit one unit of work.
    ///
    /// When the limit is exceeded a timeout of `timeout_secs` is started (if
    /// none is active) and nothing is recorded.
    pub fn admit(&mut self, timeout_secs: u64) -> Result<Decision> {
        if self.exceeded()? {
            self.timeout(timeout_secs)?;
            return Ok(Decision::Throttled {
                limit: self.limit(),
                remaining: self.remaining(),
                backoff: self.backoff()?,
            });
        }

        match self.record()? {
            Mutation::Applied => Ok(Decision::Admitted {
                limit: self.limit(),
                remaining: self.remaining(),
            }),
            Mutation::Vetoed(veto) => Ok(Decision::Vetoed {
                limit: self.limit(),
                remaining: self.remaining(),
                veto,
            }),
        }
    }

    /// Maximum hits allowed by the leaf bucket.
    pub fn limit(&self) -> u64 {
        self.leaf.max()
    }

    /// Hits currently held by the leaf bucket.
    pub fn hits(&self) -> u64 {
        self.leaf.drips()
    }

    /// Hits left before the leaf bucket is full.
    pub fn remaining(&self) -> u64 {
        self.leaf.remaining()
    }

    /// Empty the leaf bucket and drop its record.
    ///
    /// The parent bucket and any timeout are left alone.
    pub fn reset(&mut self) -> Result<bool> {
        self.leaf.reset();
        debug!(key = %self.leaf.key(), "Resetting limiter");
        self.store.forget(self.leaf.key())
    }

    /// Reset the leaf bucket and clear its timeout.
    pub fn clear(&mut self) -> Result<&mut Self> {
        self.reset()?;
        self.store.forget(&timeout_key(self.leaf.key()))?;
        Ok(self)
    }

    /// Seconds until the timeout expires; zero when none is active.
    pub fn backoff(&self) -> Result<u64> {
        let until = match self.store.get(&timeout_key(self.leaf.key()))? {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_f64().map(|v| v as i64))
                .ok_or_else(|| {
                    SluiceError::Store(format!(
                        "timeout for '{}' is not a timestamp",
                        self.leaf.key()
                    ))
                })?,
            None => return Ok(0),
        };

        let now = self.leaf.clock().now().floor() as i64;
        Ok(until.saturating_sub(now).max(0) as u64)
    }

    /// The leaf bucket.
    pub fn bucket(&self) -> &B {
        &self.leaf
    }

    /// The parent bucket, when the key is compound.
    pub fn parent(&self) -> Option<&B> {
        self.parent.as_ref()
    }

    /// All buckets, parent first.
    pub fn buckets(&self) -> impl Iterator<Item = &B> {
        self.parent.iter().chain(std::iter::once(&self.leaf))
    }
}

/// Read a bucket record from the store as settings.
fn load_settings(store: &dyn Store, key: &str) -> Result<Option<BucketSettings>> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Write a bucket record with a TTL covering its drain time.
fn persist<B: Bucket>(store: &dyn Store, bucket: &B) -> Result<()> {
    let ttl = bucket.duration().ceil().max(1.0) as u64;
    let record = serde_json::to_value(bucket.to_record())?;

    trace!(key = %bucket.key(), drips = bucket.drips(), ttl = ttl, "Persisting bucket");
    store.put(bucket.key(), record, Duration::from_secs(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::LeakyBucket;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::notify::{NotifyingBucket, RecordingSink};
    use crate::ratelimit::resolver::FixedResolver;
    use crate::store::MemoryStore;

    const NOW: f64 = 1_000_000.0;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let store = Arc::new(MemoryStore::with_clock(clock.clone()));
            Self { clock, store }
        }

        fn bucket(&self, key: &str, max: u64, rate: f64) -> LeakyBucket {
            LeakyBucket::with_clock(key, max, rate, self.clock.clone()).unwrap()
        }

        fn limiter(&self, key: &str) -> Limiter<LeakyBucket> {
            self.limiter_with(key, 60, 1.0)
        }

        fn limiter_with(&self, key: &str, max: u64, rate: f64) -> Limiter<LeakyBucket> {
            Limiter::new(self.store.clone(), self.bucket(key, max, rate)).unwrap()
        }

        fn drips(&self, key: &str) -> u64 {
            self.store.get(key).unwrap().unwrap()["drips"].as_u64().unwrap()
        }
    }

    #[test]
    fn test_persistence() {
        let fx = Fixture::new();
        let mut original = fx.limiter("original");
        assert_eq!(original.hits(), 0);
        assert_eq!(original.remaining(), 60);
        assert!(fx.store.is_empty());

        assert_eq!(original.hit().unwrap(), 1);
        assert_eq!(original.hits(), 1);
        assert_eq!(original.remaining(), 59);

        let other = fx.limiter("new");
        assert_eq!(other.hits(), 0);

        let existing = fx.limiter("original");
        assert_eq!(existing.hits(), original.hits());
        assert_eq!(existing.remaining(), original.remaining());
    }

    #[test]
    fn test_persisted_record_and_ttl() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("foo", 10, 0.5);
        limiter.hit().unwrap();
        limiter.hit().unwrap();

        let record: crate::ratelimit::BucketRecord =
            serde_json::from_value(fx.store.get("foo").unwrap().unwrap()).unwrap();
        assert_eq!(record.key, "foo");
        assert_eq!(record.drips, 2);
        assert_eq!(record.remaining, 8);
        assert_eq!(record.rate, 0.5);

        // Two drips at half a drip per second drain in four seconds.
        fx.clock.advance(3.9);
        assert!(fx.store.has("foo").unwrap());
        fx.clock.advance(0.2);
        assert!(!fx.store.has("foo").unwrap());
    }

    #[test]
    fn test_ttl_has_one_second_floor() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("fast", 10, 1000.0);
        limiter.hit().unwrap();

        fx.clock.advance(0.5);
        assert!(fx.store.has("fast").unwrap());
        fx.clock.advance(0.5);
        assert!(!fx.store.has("fast").unwrap());
    }

    #[test]
    fn test_configure() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("original");
        limiter.hit().unwrap();
        assert_eq!(limiter.limit(), 60);
        assert!(fx.store.has("original").unwrap());

        limiter.configure("changed", 100, 10.0).unwrap().hit().unwrap();

        assert!(!fx.store.has("original").unwrap());
        assert!(fx.store.has("changed").unwrap());
        assert_eq!(limiter.limit(), 100);
        assert_eq!(limiter.bucket().key(), "changed");
        assert_eq!(fx.store.get("changed").unwrap().unwrap()["rate"], serde_json::json!(10.0));
        // The old leaf was reset before rotating, so only the new hit counts.
        assert_eq!(limiter.hits(), 1);
    }

    #[test]
    fn test_configure_same_key_keeps_state() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        limiter.hit().unwrap();
        limiter.hit().unwrap();

        limiter.configure("foo", 5, 2.0).unwrap();
        assert_eq!(limiter.hits(), 2);
        assert_eq!(limiter.limit(), 5);
        assert_eq!(limiter.bucket().rate(), 2.0);
    }

    #[test]
    fn test_configure_restores_stored_state_for_new_key() {
        let fx = Fixture::new();
        let mut other = fx.limiter("bar");
        for _ in 0..4 {
            other.hit().unwrap();
        }

        let mut limiter = fx.limiter("foo");
        limiter.configure("bar", 30, 1.0).unwrap();
        assert_eq!(limiter.hits(), 4);
        assert_eq!(limiter.limit(), 30);
    }

    #[test]
    fn test_configure_rotation_keeps_parent() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo:bar");
        limiter.hit().unwrap();

        limiter.configure("foo:baz", 60, 1.0).unwrap();
        assert!(!fx.store.has("foo:bar").unwrap());
        assert_eq!(fx.drips("foo"), 1);
        assert_eq!(limiter.parent().map(|p| p.key()), Some("foo"));

        limiter.hit().unwrap();
        assert_eq!(fx.drips("foo"), 2);
        assert_eq!(fx.drips("foo:baz"), 1);
    }

    #[test]
    fn test_configure_rejects_invalid_parameters() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        assert!(matches!(limiter.configure("", 10, 1.0), Err(SluiceError::Config(_))));
        assert!(matches!(limiter.configure("foo", 0, 1.0), Err(SluiceError::Config(_))));
        assert!(matches!(limiter.configure("foo", 10, -2.0), Err(SluiceError::Config(_))));
        assert_eq!(limiter.limit(), 60);
    }

    #[test]
    fn test_failed_rotation_keeps_state() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        for _ in 0..3 {
            limiter.hit().unwrap();
        }

        assert!(matches!(limiter.configure("bar", 0, 1.0), Err(SluiceError::Config(_))));
        assert!(matches!(limiter.configure("bar", 10, 0.0), Err(SluiceError::Config(_))));

        assert_eq!(limiter.bucket().key(), "foo");
        assert_eq!(limiter.hits(), 3);
        assert_eq!(fx.drips("foo"), 3);
        assert!(!fx.store.has("bar").unwrap());
    }

    #[test]
    fn test_resolve() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("default");

        limiter.resolve(&FixedResolver::new("user42", 3, 0.5, 10)).unwrap();
        assert_eq!(limiter.bucket().key(), "user42");
        assert_eq!(limiter.limit(), 3);

        let empty = FixedResolver::new("", 3, 0.5, 10);
        assert!(matches!(limiter.resolve(&empty), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_exceeded() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("default", 2, 1.0);

        limiter.hit().unwrap();
        assert!(!limiter.exceeded().unwrap());

        limiter.hit().unwrap();
        assert!(limiter.exceeded().unwrap());

        limiter.timeout(60).unwrap();
        limiter.reset().unwrap();
        assert!(limiter.exceeded().unwrap());
        assert_eq!(limiter.hits(), 0);
    }

    #[test]
    fn test_exceeded_recovers_after_leak() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("default", 2, 1.0);
        limiter.hit().unwrap();
        limiter.hit().unwrap();
        assert!(limiter.exceeded().unwrap());

        fx.clock.advance(1.0);
        assert!(!limiter.exceeded().unwrap());
        assert_eq!(limiter.hits(), 1);
    }

    #[test]
    fn test_full_parent_throttles_child() {
        let fx = Fixture::new();
        let mut sibling = fx.limiter_with("foo:a", 3, 0.1);
        for _ in 0..3 {
            sibling.hit().unwrap();
        }

        let mut limiter = fx.limiter_with("foo:b", 3, 0.1);
        assert_eq!(limiter.hits(), 0);
        assert!(limiter.exceeded().unwrap());
    }

    #[test]
    fn test_exceeded_leaks_every_bucket() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("foo:bar", 2, 1.0);
        limiter.hit().unwrap();
        limiter.hit().unwrap();

        fx.clock.advance(1.0);
        assert!(!limiter.exceeded().unwrap());
        assert!(limiter.buckets().all(|bucket| bucket.timer() == NOW + 1.0));
        assert!(limiter.buckets().all(|bucket| bucket.drips() == 1));
    }

    #[test]
    fn test_timeout() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        limiter.timeout(60).unwrap();

        assert_eq!(fx.store.get("foo:timeout").unwrap(), Some(serde_json::json!(NOW as i64 + 60)));
        assert_eq!(limiter.backoff().unwrap(), 60);

        let stored = fx.store.get("foo:timeout").unwrap();
        limiter.timeout(10).unwrap();
        assert_eq!(fx.store.get("foo:timeout").unwrap(), stored);
    }

    #[test]
    fn test_timeout_is_idempotent() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        limiter.timeout(60).unwrap();
        let first = fx.store.get("foo:timeout").unwrap();

        fx.clock.advance(5.0);
        limiter.timeout(60).unwrap();
        assert_eq!(fx.store.get("foo:timeout").unwrap(), first);
        assert_eq!(limiter.backoff().unwrap(), 55);
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");

        limiter.timeout(u64::MAX).unwrap();
        assert_eq!(
            fx.store.get("foo:timeout").unwrap(),
            Some(serde_json::json!(i64::MAX))
        );
        assert!(limiter.has_timeout().unwrap());
        assert!(limiter.backoff().unwrap() > 0);
    }

    #[test]
    fn test_backoff_never_negative() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        assert_eq!(limiter.backoff().unwrap(), 0);

        limiter.timeout(10).unwrap();
        fx.clock.advance(4.0);
        assert_eq!(limiter.backoff().unwrap(), 6);

        fx.clock.advance(10.0);
        assert_eq!(limiter.backoff().unwrap(), 0);
        assert!(!limiter.has_timeout().unwrap());
        assert!(!limiter.exceeded().unwrap());
    }

    #[test]
    fn test_backoff_rejects_garbage_timeout() {
        let fx = Fixture::new();
        let limiter = fx.limiter("foo");
        fx.store
            .put("foo:timeout", serde_json::json!("soon"), Duration::from_secs(10))
            .unwrap();

        assert!(matches!(limiter.backoff(), Err(SluiceError::Store(_))));
    }

    #[test]
    fn test_parent_timeout_applies_to_child() {
        let fx = Fixture::new();
        let mut parent = fx.limiter("foo");
        parent.timeout(30).unwrap();

        let mut child = fx.limiter("foo:bar");
        assert!(child.has_timeout().unwrap());
        assert!(child.exceeded().unwrap());
        // Backoff only reports the leaf's own timeout.
        assert_eq!(child.backoff().unwrap(), 0);
    }

    #[test]
    fn test_clear() {
        let fx = Fixture::new();
        fx.limiter("bar").hit().unwrap();
        let mut limiter = fx.limiter("foo");
        limiter.hit().unwrap();
        limiter.timeout(60).unwrap();

        assert_eq!(limiter.hits(), 1);
        assert!(limiter.has_timeout().unwrap());
        let keys: Vec<String> = fx.store.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["bar", "foo", "foo:timeout"]);

        limiter.clear().unwrap();
        let keys: Vec<String> = fx.store.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["bar"]);
        assert_eq!(limiter.hits(), 0);
    }

    #[test]
    fn test_reset_keeps_timeout() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter("foo");
        limiter.hit().unwrap();
        limiter.timeout(60).unwrap();

        assert!(limiter.reset().unwrap());
        assert!(!fx.store.has("foo").unwrap());
        assert!(fx.store.has("foo:timeout").unwrap());
    }

    #[test]
    fn test_multiple_buckets() {
        let fx = Fixture::new();
        // Three segments still produce only two buckets.
        let mut limiter = fx.limiter("foo:bar:baz");
        limiter.hit().unwrap();

        let snapshot = fx.store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_ne!(snapshot["foo"], snapshot["foo:bar:baz"]);
        assert_eq!(fx.drips("foo"), 1);
        assert_eq!(fx.drips("foo:bar:baz"), 1);

        limiter.reset().unwrap();
        let snapshot = fx.store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(fx.drips("foo"), 1);

        limiter.hit().unwrap();
        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.drips("foo"), 2);
        assert_eq!(fx.drips("foo:bar:baz"), 1);

        limiter.timeout(60).unwrap();
        assert_eq!(fx.store.len(), 3);
        assert!(fx.store.has("foo:bar:baz:timeout").unwrap());

        limiter.clear().unwrap();
        let keys: Vec<String> = fx.store.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["foo"]);
        assert_eq!(fx.drips("foo"), 2);

        // A different child reuses the parent bucket.
        let mut limiter = fx.limiter("foo:bar");
        limiter.hit().unwrap();
        assert_eq!(fx.store.len(), 2);
        assert_eq!(fx.drips("foo"), 3);
        assert_eq!(fx.drips("foo:bar"), 1);
    }

    #[test]
    fn test_simple_key_has_one_bucket() {
        let fx = Fixture::new();
        let limiter = fx.limiter("foo");
        assert!(limiter.parent().is_none());
        assert_eq!(limiter.buckets().count(), 1);
    }

    #[test]
    fn test_admit() {
        let fx = Fixture::new();
        let mut limiter = fx.limiter_with("api:user", 2, 1.0);

        assert_eq!(
            limiter.admit(30).unwrap(),
            Decision::Admitted {
                limit: 2,
                remaining: 1,
            }
        );
        assert!(limiter.admit(30).unwrap().is_admitted());

        assert_eq!(
            limiter.admit(30).unwrap(),
            Decision::Throttled {
                limit: 2,
                remaining: 0,
                backoff: 30,
            }
        );
        assert_eq!(limiter.hits(), 2);

        // Drained buckets stay locked until the timeout expires.
        fx.clock.advance(10.0);
        assert!(!limiter.admit(30).unwrap().is_admitted());
        fx.clock.advance(20.0);
        assert!(limiter.admit(30).unwrap().is_admitted());
    }

    #[test]
    fn test_notifying_buckets_report_restores() {
        let fx = Fixture::new();
        let sink = Arc::new(RecordingSink::new());
        let bucket = NotifyingBucket::new(fx.bucket("foo:bar", 60, 1.0), sink.clone());

        let mut limiter = Limiter::new(fx.store.clone(), bucket).unwrap();
        // Each restored bucket reports Filling + Filled.
        assert_eq!(sink.len(), 4);

        limiter.configure("foo:bar:baz", 10, 1.0).unwrap();
        assert_eq!(sink.len(), 6);

        limiter.hit().unwrap();
        assert_eq!(sink.len(), 10);
        assert!(sink.notifications()[6..].iter().any(|n| n.key() == "foo"));
    }

    #[test]
    fn test_vetoed_fill_is_persisted_unchanged() {
        use crate::ratelimit::bucket::Veto;
        use crate::ratelimit::notify::Notification;

        let fx = Fixture::new();
        let sink = Arc::new(RecordingSink::with_veto(|n| match n {
            Notification::Filling(f) if f.drips == 1 => Some(Veto::new("exempt")),
            _ => None,
        }));
        let bucket = NotifyingBucket::new(fx.bucket("foo", 60, 1.0), sink);

        let mut limiter = Limiter::new(fx.store.clone(), bucket).unwrap();
        assert_eq!(limiter.hit().unwrap(), 0);
        assert_eq!(fx.drips("foo"), 0);
    }

    #[test]
    fn test_vetoed_hit_keeps_stored_drips() {
        use crate::ratelimit::bucket::Veto;
        use crate::ratelimit::notify::Notification;

        let fx = Fixture::new();
        let mut plain = fx.limiter_with("foo", 1, 1.0);
        plain.hit().unwrap();
        assert!(plain.exceeded().unwrap());

        let sink = Arc::new(RecordingSink::with_veto(|n| match n {
            Notification::Filling(f) if f.drips == 1 => Some(Veto::new("exempt")),
            _ => None,
        }));
        let bucket = NotifyingBucket::new(fx.bucket("foo", 1, 1.0), sink);
        let mut limiter = Limiter::new(fx.store.clone(), bucket).unwrap();
        assert_eq!(limiter.hits(), 1);

        assert_eq!(limiter.record().unwrap(), Mutation::Vetoed(Veto::new("exempt")));
        assert_eq!(fx.drips("foo"), 1);

        let mut plain = fx.limiter_with("foo", 1, 1.0);
        assert!(plain.exceeded().unwrap());
    }

    #[test]
    fn test_admit_reports_veto() {
        use crate::ratelimit::bucket::Veto;
        use crate::ratelimit::notify::Notification;

        let fx = Fixture::new();
        let sink = Arc::new(RecordingSink::with_veto(|n| match n {
            Notification::Filling(f) if f.key == "api:user" => Some(Veto::new("exempt")),
            _ => None,
        }));
        let bucket = NotifyingBucket::new(fx.bucket("api:user", 5, 1.0), sink);
        let mut limiter = Limiter::new(fx.store.clone(), bucket).unwrap();

        assert_eq!(
            limiter.admit(30).unwrap(),
            Decision::Vetoed {
                limit: 5,
                remaining: 5,
                veto: Veto::new("exempt"),
            }
        );
        assert_eq!(fx.drips("api"), 1);
        assert_eq!(fx.drips("api:user"), 0);
    }

    struct FailingStore;

    impl Store for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        fn put(&self, key: &str, _value: Value, _ttl: Duration) -> Result<()> {
            Err(SluiceError::Store(format!("write to '{}' failed", key)))
        }

        fn forget(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_store_failures_propagate() {
        let fx = Fixture::new();
        let mut limiter = Limiter::new(Arc::new(FailingStore), fx.bucket("foo", 10, 1.0)).unwrap();

        assert!(matches!(limiter.hit(), Err(SluiceError::Store(_))));
        assert!(matches!(limiter.timeout(10), Err(SluiceError::Store(_))));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let fx = Fixture::new();
        fx.store
            .put("foo", serde_json::json!({"drips": "many"}), Duration::from_secs(10))
            .unwrap();

        let result = Limiter::new(fx.store.clone(), fx.bucket("foo", 10, 1.0));
        assert!(matches!(result, Err(SluiceError::Serialization(_))));
    }
}
