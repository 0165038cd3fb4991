//! Leaky-bucket rate limiting.

mod bucket;
mod clock;
mod key;
mod limiter;
mod notify;
mod resolver;
mod rules;

pub use bucket::{
    Bucket, BucketRecord, BucketSettings, LeakyBucket, Mutation, Veto, DEFAULT_MAX, DEFAULT_RATE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{timeout_key, BucketKey, KEY_SEPARATOR};
pub use limiter::{Decision, Limiter};
pub use notify::{
    Filled, Filling, Leaked, Leaking, Notification, NotificationSink, NotifyingBucket,
    RecordingSink, TracingSink,
};
pub use resolver::{validate_resolver, FixedResolver, Resolver, RuleResolver};
pub use rules::{LimitParams, LimitRule, LimitRules, DEFAULT_DURATION};
