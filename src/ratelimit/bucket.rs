//! Leaky bucket implementation.
//!
//! A bucket accumulates drips as work is admitted and drains them
//! continuously at a fixed rate. Decay is applied lazily: nothing happens
//! between calls, and `leak` folds the elapsed time into the drip count.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use crate::error::{Result, SluiceError};

/// Default capacity for a bucket.
pub const DEFAULT_MAX: u64 = 60;
/// Default drain rate in drips per second.
pub const DEFAULT_RATE: f64 = 1.0;

/// Why a pending bucket mutation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    /// Human-readable reason
    pub reason: String,
}

impl Veto {
    /// Create a veto with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Veto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vetoed: {}", self.reason)
    }
}

/// Outcome of a `fill` or `leak` call.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// The bucket state was updated
    Applied,
    /// A listener refused the mutation; the bucket is unchanged
    Vetoed(Veto),
}

impl Mutation {
    /// Whether the mutation took effect.
    pub fn is_applied(&self) -> bool {
        matches!(self, Mutation::Applied)
    }
}

/// A partial set of bucket settings.
///
/// Unknown fields (such as `key` and `remaining` in a stored record) are
/// ignored when deserializing, so a snapshot can never change a bucket's key
/// or its derived values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Last instant decay was applied, in UNIX seconds
    #[serde(default)]
    pub timer: Option<f64>,
    /// Capacity
    #[serde(default)]
    pub max: Option<u64>,
    /// Drain rate in drips per second
    #[serde(default)]
    pub rate: Option<f64>,
    /// Drip count, applied through `fill`
    #[serde(default)]
    pub drips: Option<i64>,
}

impl BucketSettings {
    /// Overlay `other` on top of these settings; fields set in `other` win.
    pub fn merge(self, other: BucketSettings) -> Self {
        Self {
            timer: other.timer.or(self.timer),
            max: other.max.or(self.max),
            rate: other.rate.or(self.rate),
            drips: other.drips.or(self.drips),
        }
    }

    /// Reject values no bucket may hold.
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max {
            validate_max(max)?;
        }
        if let Some(rate) = self.rate {
            validate_rate(rate)?;
        }
        if let Some(timer) = self.timer {
            if !timer.is_finite() {
                return Err(SluiceError::Config(format!(
                    "bucket timer must be finite, got {}",
                    timer
                )));
            }
        }
        Ok(())
    }
}

/// The persisted form of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub key: String,
    pub timer: f64,
    pub max: u64,
    pub rate: f64,
    pub drips: u64,
    pub remaining: u64,
}

impl From<&BucketRecord> for BucketSettings {
    fn from(record: &BucketRecord) -> Self {
        Self {
            timer: Some(record.timer),
            max: Some(record.max),
            rate: Some(record.rate),
            drips: Some(i64::try_from(record.drips).unwrap_or(i64::MAX)),
        }
    }
}

/// Operations shared by every bucket implementation.
pub trait Bucket: Send {
    /// The bucket's key. Fixed for the life of the bucket.
    fn key(&self) -> &str;

    /// Last instant decay was applied, in UNIX seconds.
    fn timer(&self) -> f64;

    fn set_timer(&mut self, timer: f64);

    /// Capacity before the bucket overflows.
    fn max(&self) -> u64;

    fn set_max(&mut self, max: u64) -> Result<()>;

    /// Drips drained per second.
    fn rate(&self) -> f64;

    fn set_rate(&mut self, rate: f64) -> Result<()>;

    /// Drips currently in the bucket, rounded up.
    fn drips(&self) -> u64;

    /// Drips that fit before the bucket is full.
    fn remaining(&self) -> u64 {
        self.max().saturating_sub(self.drips())
    }

    fn is_full(&self) -> bool {
        self.drips() >= self.max()
    }

    fn is_empty(&self) -> bool {
        self.drips() == 0
    }

    /// Seconds from now until the bucket has fully drained.
    fn duration(&self) -> f64;

    /// Apply the decay accumulated since `timer`, optionally at a one-off rate.
    fn leak(&mut self, rate: Option<f64>) -> Mutation;

    /// Add drips. Out-of-range amounts saturate instead of failing.
    fn fill(&mut self, drips: i64) -> Mutation;

    /// Empty the bucket and restart its timer.
    fn reset(&mut self);

    /// Apply a partial set of settings. Nothing is applied if any value is invalid.
    fn configure(&mut self, settings: &BucketSettings) -> Result<()>;

    /// The clock this bucket reads time from.
    fn clock(&self) -> &Arc<dyn Clock>;

    /// Build a fresh bucket of the same kind, sharing clock and collaborators.
    fn sibling(&self, key: &str, max: u64, rate: f64) -> Result<Self>
    where
        Self: Sized;

    /// Snapshot the bucket for persistence.
    fn to_record(&self) -> BucketRecord {
        BucketRecord {
            key: self.key().to_string(),
            timer: self.timer(),
            max: self.max(),
            rate: self.rate(),
            drips: self.drips(),
            remaining: self.remaining(),
        }
    }
}

/// A bucket that leaks drips at a constant rate.
pub struct LeakyBucket {
    key: BucketKey,
    max: u64,
    rate: f64,
    drips: f64,
    timer: f64,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    /// Create an empty bucket on the system clock.
    ///
    /// `LeakyBucket::new("foo", 100, 0.1)` holds 100 drips and drains one
    /// every ten seconds.
    pub fn new(key: &str, max: u64, rate: f64) -> Result<Self> {
        Self::with_clock(key, max, rate, Arc::new(SystemClock))
    }

    /// Create an empty bucket reading time from `clock`.
    pub fn with_clock(key: &str, max: u64, rate: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_max(max)?;
        validate_rate(rate)?;

        let now = clock.now();
        Ok(Self {
            key: BucketKey::new(key)?,
            max,
            rate,
            drips: 0.0,
            timer: now,
            clock,
        })
    }

    /// Clamp a drip amount to `[0, max]`.
    fn bounded(&self, drips: i64) -> u64 {
        if drips <= 0 {
            0
        } else {
            (drips as u64).min(self.max)
        }
    }
}

impl Bucket for LeakyBucket {
    fn key(&self) -> &str {
        self.key.as_str()
    }

    fn timer(&self) -> f64 {
        self.timer
    }

    fn set_timer(&mut self, timer: f64) {
        self.timer = timer;
    }

    fn max(&self) -> u64 {
        self.max
    }

    fn set_max(&mut self, max: u64) -> Result<()> {
        validate_max(max)?;
        self.max = max;
        self.drips = self.drips.min(max as f64);
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        validate_rate(rate)?;
        self.rate = rate;
        Ok(())
    }

    fn drips(&self) -> u64 {
        self.drips.max(0.0).ceil() as u64
    }

    fn duration(&self) -> f64 {
        let now = self.clock.now();
        (now + self.drips() as f64 / self.rate - self.timer).max(0.0)
    }

    fn leak(&mut self, rate: Option<f64>) -> Mutation {
        let now = self.clock.now();
        let rate = rate.unwrap_or(self.rate);
        let elapsed = now - self.timer;
        // Floor keeps partial seconds in the bucket; skew and bad rates drain nothing.
        let drops = (elapsed * rate).floor().max(0.0);

        self.drips = (self.drips() as f64 - drops).clamp(0.0, self.max as f64);
        self.timer = now;

        Mutation::Applied
    }

    fn fill(&mut self, drips: i64) -> Mutation {
        let added = self.bounded(drips);
        self.drips = self.drips().saturating_add(added).min(self.max) as f64;

        Mutation::Applied
    }

    fn reset(&mut self) {
        self.drips = 0.0;
        self.timer = self.clock.now();
    }

    fn configure(&mut self, settings: &BucketSettings) -> Result<()> {
        settings.validate()?;

        if let Some(timer) = settings.timer {
            self.timer = timer;
        }
        if let Some(max) = settings.max {
            self.set_max(max)?;
        }
        if let Some(rate) = settings.rate {
            self.set_rate(rate)?;
        }
        if let Some(drips) = settings.drips {
            self.drips = 0.0;
            let _ = self.fill(drips);
        }

        Ok(())
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn sibling(&self, key: &str, max: u64, rate: f64) -> Result<Self> {
        Self::with_clock(key, max, rate, Arc::clone(&self.clock))
    }
}

impl std::fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("key", &self.key.as_str())
            .field("max", &self.max)
            .field("rate", &self.rate)
            .field("drips", &self.drips)
            .field("timer", &self.timer)
            .finish()
    }
}

fn validate_max(max: u64) -> Result<()> {
    if max == 0 {
        return Err(SluiceError::Config("bucket max must be greater than zero".to_string()));
    }
    Ok(())
}

fn validate_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SluiceError::Config(format!(
            "bucket rate must be a positive number, got {}",
            rate
        )));
    }
    Ok(())
}
