//! Limiter parameter resolution.

use super::key::KEY_SEPARATOR;
use super::rules::{LimitParams, LimitRules};
use crate::error::{Result, SluiceError};

/// Produces the key and limits a limiter should use.
pub trait Resolver {
    /// Bucket key for the subject being limited.
    fn key(&self) -> String;

    /// Bucket capacity.
    fn max(&self) -> u64;

    /// Drain rate in drips per second.
    fn rate(&self) -> f64;

    /// Timeout in seconds once the limit is exceeded.
    fn duration(&self) -> u64;
}

/// Reject resolver output that cannot configure a bucket.
pub fn validate_resolver(resolver: &dyn Resolver) -> Result<()> {
    if resolver.key().is_empty() {
        return Err(SluiceError::Config("resolver produced an empty key".to_string()));
    }
    if resolver.max() == 0 {
        return Err(SluiceError::Config("resolver produced a zero max".to_string()));
    }
    let rate = resolver.rate();
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SluiceError::Config(format!("resolver produced a non-positive rate: {}", rate)));
    }
    Ok(())
}

/// A resolver with fixed parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedResolver {
    key: String,
    params: LimitParams,
}

impl FixedResolver {
    pub fn new(key: impl Into<String>, max: u64, rate: f64, duration: u64) -> Self {
        Self {
            key: key.into(),
            params: LimitParams { max, rate, duration },
        }
    }

    /// Default limits for `key`.
    pub fn with_defaults(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: LimitParams::default(),
        }
    }

    /// Scope this resolver to a tag. The tag becomes the leaf of a compound
    /// key, so all tags of one subject share a parent bucket.
    pub fn tagged(&self, tag: &str) -> Self {
        Self {
            key: format!("{}{}{}", self.key, KEY_SEPARATOR, tag),
            params: self.params,
        }
    }
}

impl Resolver for FixedResolver {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn max(&self) -> u64 {
        self.params.max
    }

    fn rate(&self) -> f64 {
        self.params.rate
    }

    fn duration(&self) -> u64 {
        self.params.duration
    }
}

/// Resolves parameters for a key from a rule table.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResolver {
    key: String,
    params: LimitParams,
}

impl RuleResolver {
    pub fn new(rules: &LimitRules, key: impl Into<String>, defaults: LimitParams) -> Self {
        let key = key.into();
        let params = rules.find_limit(&key, defaults);
        Self { key, params }
    }

    /// The resolved parameters.
    pub fn params(&self) -> LimitParams {
        self.params
    }
}

impl Resolver for RuleResolver {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn max(&self) -> u64 {
        self.params.max
    }

    fn rate(&self) -> f64 {
        self.params.rate
    }

    fn duration(&self) -> u64 {
        self.params.duration
    }
}
