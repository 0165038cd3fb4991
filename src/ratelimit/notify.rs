//! Bucket notifications.
//!
//! `NotifyingBucket` wraps another bucket and reports every fill and leak to a
//! `NotificationSink`: once before the mutation and once after. The "before"
//! call may veto the mutation, in which case the wrapped bucket is untouched.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketSettings, Mutation, Veto};
use super::clock::Clock;
use crate::error::Result;

/// Drips are about to be added to a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filling {
    pub key: String,
    /// Requested amount, before bounds are applied
    pub drips: i64,
}

/// Drips were added to a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filled {
    pub key: String,
    /// Total drips in the bucket after the fill
    pub drips: u64,
    pub remaining: u64,
}

/// A bucket is about to leak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaking {
    pub key: String,
    /// Effective rate for this leak
    pub rate: f64,
}

/// A bucket leaked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaked {
    pub key: String,
    /// Drips removed by the leak
    pub drips: u64,
    pub remaining: u64,
}

/// A notification emitted around a bucket mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Filling(Filling),
    Filled(Filled),
    Leaking(Leaking),
    Leaked(Leaked),
}

impl Notification {
    /// Name of the notification kind.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Filling(_) => "filling",
            Notification::Filled(_) => "filled",
            Notification::Leaking(_) => "leaking",
            Notification::Leaked(_) => "leaked",
        }
    }

    /// Key of the bucket that emitted the notification.
    pub fn key(&self) -> &str {
        match self {
            Notification::Filling(n) => &n.key,
            Notification::Filled(n) => &n.key,
            Notification::Leaking(n) => &n.key,
            Notification::Leaked(n) => &n.key,
        }
    }

    /// Whether this is a "before" notification that may veto the mutation.
    pub fn is_pending(&self) -> bool {
        matches!(self, Notification::Filling(_) | Notification::Leaking(_))
    }

    /// Flatten the payload into a JSON object, tagged with the `event` name.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Receives bucket notifications.
pub trait NotificationSink: Send + Sync {
    /// Called before a mutation. Returning a veto skips the mutation.
    fn before(&self, notification: &Notification) -> Option<Veto>;

    /// Called after a mutation took effect.
    fn after(&self, notification: &Notification);
}

/// Emits notifications as `tracing` events. Never vetoes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn before(&self, notification: &Notification) -> Option<Veto> {
        trace!(
            event = notification.name(),
            key = %notification.key(),
            payload = ?notification.to_map(),
            "Bucket mutation pending"
        );
        None
    }

    fn after(&self, notification: &Notification) {
        debug!(
            event = notification.name(),
            key = %notification.key(),
            payload = ?notification.to_map(),
            "Bucket mutated"
        );
    }
}

type VetoPolicy = Box<dyn Fn(&Notification) -> Option<Veto> + Send + Sync>;

/// Keeps every notification it receives, in order.
///
/// An optional policy can veto pending mutations.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    policy: Option<VetoPolicy>,
}

impl RecordingSink {
    /// Create a sink that records and never vetoes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that asks `policy` whether to veto each pending mutation.
    pub fn with_veto<F>(policy: F) -> Self
    where
        F: Fn(&Notification) -> Option<Veto> + Send + Sync + 'static,
    {
        Self {
            notifications: Mutex::new(Vec::new()),
            policy: Some(Box::new(policy)),
        }
    }

    /// All notifications received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
    }
}

impl NotificationSink for RecordingSink {
    fn before(&self, notification: &Notification) -> Option<Veto> {
        self.notifications.lock().push(notification.clone());
        self.policy.as_ref().and_then(|policy| policy(notification))
    }

    fn after(&self, notification: &Notification) {
        self.notifications.lock().push(notification.clone());
    }
}

impl std::fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSink")
            .field("notifications", &self.len())
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

/// A bucket that reports its fills and leaks.
pub struct NotifyingBucket<B: Bucket> {
    inner: B,
    sink: Arc<dyn NotificationSink>,
}

impl<B: Bucket> NotifyingBucket<B> {
    /// Wrap `inner`, reporting to `sink`.
    pub fn new(inner: B, sink: Arc<dyn NotificationSink>) -> Self {
        Self { inner, sink }
    }

    /// The wrapped bucket.
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Bucket> Bucket for NotifyingBucket<B> {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn timer(&self) -> f64 {
        self.inner.timer()
    }

    fn set_timer(&mut self, timer: f64) {
        self.inner.set_timer(timer);
    }

    fn max(&self) -> u64 {
        self.inner.max()
    }

    fn set_max(&mut self, max: u64) -> Result<()> {
        self.inner.set_max(max)
    }

    fn rate(&self) -> f64 {
        self.inner.rate()
    }

    fn set_rate(&mut self, rate: f64) -> Result<()> {
        self.inner.set_rate(rate)
    }

    fn drips(&self) -> u64 {
        self.inner.drips()
    }

    fn duration(&self) -> f64 {
        self.inner.duration()
    }

    fn leak(&mut self, rate: Option<f64>) -> Mutation {
        let rate = rate.unwrap_or_else(|| self.inner.rate());

        let leaking = Notification::Leaking(Leaking {
            key: self.key().to_string(),
            rate,
        });
        if let Some(veto) = self.sink.before(&leaking) {
            return Mutation::Vetoed(veto);
        }

        let before = self.inner.drips();
        if let Mutation::Vetoed(veto) = self.inner.leak(Some(rate)) {
            return Mutation::Vetoed(veto);
        }

        self.sink.after(&Notification::Leaked(Leaked {
            key: self.key().to_string(),
            drips: before.saturating_sub(self.inner.drips()),
            remaining: self.inner.remaining(),
        }));

        Mutation::Applied
    }

    fn fill(&mut self, drips: i64) -> Mutation {
        let filling = Notification::Filling(Filling {
            key: self.key().to_string(),
            drips,
        });
        if let Some(veto) = self.sink.before(&filling) {
            return Mutation::Vetoed(veto);
        }

        if let Mutation::Vetoed(veto) = self.inner.fill(drips) {
            return Mutation::Vetoed(veto);
        }

        self.sink.after(&Notification::Filled(Filled {
            key: self.key().to_string(),
            drips: self.inner.drips(),
            remaining: self.inner.remaining(),
        }));

        Mutation::Applied
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn configure(&mut self, settings: &BucketSettings) -> Result<()> {
        self.inner.configure(settings)?;

        // A restore is reported as a fill but cannot be vetoed.
        if let Some(drips) = settings.drips {
            self.sink.after(&Notification::Filling(Filling {
                key: self.key().to_string(),
                drips,
            }));
            self.sink.after(&Notification::Filled(Filled {
                key: self.key().to_string(),
                drips: self.inner.drips(),
                remaining: self.inner.remaining(),
            }));
        }

        Ok(())
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.inner.clock()
    }

    fn sibling(&self, key: &str, max: u64, rate: f64) -> Result<Self> {
        Ok(Self {
            inner: self.inner.sibling(key, max, rate)?,
            sink: Arc::clone(&self.sink),
        })
    }
}

impl<B: Bucket + std::fmt::Debug> std::fmt::Debug for NotifyingBucket<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyingBucket")
            .field("inner", &self.inner)
            .finish()
    }
}
