//! Limit rules configuration and matching.
//!
//! Rules form a tree keyed by the `:`-separated segments of a bucket key.
//! A rule matches one segment (`*` matches any) and may set any of the
//! limit parameters; child rules refine the next segment. Parameters are
//! inherited down the matched path, so the most specific rule wins.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::bucket::{DEFAULT_MAX, DEFAULT_RATE};
use super::key::KEY_SEPARATOR;
use crate::error::{Result, SluiceError};

/// Default lockout, in seconds, once a limit is exceeded.
pub const DEFAULT_DURATION: u64 = 60;

/// Segment pattern that matches any value.
const WILDCARD: &str = "*";

/// Resolved parameters for a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitParams {
    /// Bucket capacity
    pub max: u64,
    /// Drain rate in drips per second
    pub rate: f64,
    /// Timeout in seconds applied when the limit is exceeded
    pub duration: u64,
}

impl Default for LimitParams {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            rate: DEFAULT_RATE,
            duration: DEFAULT_DURATION,
        }
    }
}

/// A complete rule table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitRules {
    /// Top-level rules, matched against the first key segment
    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

/// A single node in the rule tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Segment to match, or `*` for any
    pub key: String,
    #[serde(default)]
    pub max: Option<u64>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub duration: Option<u64>,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
    /// Rules for the next key segment
    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

impl LimitRule {
    fn matches(&self, segment: &str) -> bool {
        self.is_wildcard() || self.key == segment
    }

    fn is_wildcard(&self) -> bool {
        self.key == WILDCARD
    }

    fn apply(&self, params: LimitParams) -> LimitParams {
        LimitParams {
            max: self.max.unwrap_or(params.max),
            rate: self.rate.unwrap_or(params.rate),
            duration: self.duration.unwrap_or(params.duration),
        }
    }
}

impl LimitRules {
    /// Create an empty rule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: LimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject rules that would produce invalid buckets.
    pub fn validate(&self) -> Result<()> {
        fn check(rules: &[LimitRule]) -> Result<()> {
            for rule in rules {
                if rule.key.is_empty() {
                    return Err(SluiceError::Config("rule key must not be empty".to_string()));
                }
                if rule.max == Some(0) {
                    return Err(SluiceError::Config(format!("rule '{}' has a zero max", rule.key)));
                }
                if let Some(rate) = rule.rate {
                    if !rate.is_finite() || rate <= 0.0 {
                        return Err(SluiceError::Config(format!(
                            "rule '{}' has a non-positive rate",
                            rule.key
                        )));
                    }
                }
                check(&rule.rules)?;
            }
            Ok(())
        }
        check(&self.rules)
    }

    /// Resolve the parameters for `key`, starting from `defaults`.
    pub fn find_limit(&self, key: &str, defaults: LimitParams) -> LimitParams {
        let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        Self::find_path(&self.rules, &segments)
            .into_iter()
            .fold(defaults, |params, rule| rule.apply(params))
    }

    /// Name of the most specific rule matching `key`, if any.
    pub fn find_name(&self, key: &str) -> Option<&str> {
        let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        Self::find_path(&self.rules, &segments)
            .into_iter()
            .rev()
            .find_map(|rule| rule.name.as_deref())
    }

    /// Find the deepest chain of rules matching consecutive key segments.
    ///
    /// At equal depth an exact segment match beats a wildcard, and earlier
    /// rules beat later ones.
    fn find_path<'a>(rules: &'a [LimitRule], segments: &[&str]) -> Vec<&'a LimitRule> {
        let Some((segment, rest)) = segments.split_first() else {
            return Vec::new();
        };

        let mut best: Vec<&LimitRule> = Vec::new();
        for rule in rules.iter().filter(|rule| rule.matches(segment)) {
            let mut path = vec![rule];
            path.extend(Self::find_path(&rule.rules, rest));

            let deeper = path.len() > best.len();
            let more_exact = path.len() == best.len()
                && !rule.is_wildcard()
                && best.first().map_or(false, |b| b.is_wildcard());
            if deeper || more_exact {
                best = path;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
rules:
  - key: api
    name: api
    max: 100
    rate: 10
    rules:
      - key: "*"
        max: 20
      - key: admin
        name: api-admin
        max: 500
        duration: 5
  - key: login
    max: 5
    rate: 0.1
    duration: 300
"#;

    #[test]
    fn test_parse_rules() {
        let rules = LimitRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.rules.len(), 2);
        assert_eq!(rules.rules[0].rules.len(), 2);
    }

    #[test]
    fn test_unmatched_key_uses_defaults() {
        let rules = LimitRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.find_limit("other:thing", LimitParams::default()), LimitParams::default());
    }

    #[test]
    fn test_top_level_match() {
        let rules = LimitRules::from_yaml(RULES).unwrap();
        let params = rules.find_limit("login", LimitParams::default());
        assert_eq!(
            params,
            LimitParams {
                max: 5,
                rate: 0.1,
                duration: 300,
            }
        );
    }

    #[test]
    fn test_parameters_inherit_down_the_path() {
        let rules = LimitRules::from_yaml(RULES).unwrap();

        let params = rules.find_limit("api:user42", LimitParams::default());
        assert_eq!(params.max, 20);
        assert_eq!(params.rate, 10.0);
        assert_eq!(params.duration, DEFAULT_DURATION);
    }

    #[test]
    fn test_exact_segment_beats_wildcard() {
        let rules = LimitRules::from_yaml(RULES).unwrap();

        let params = rules.find_limit("api:admin", LimitParams::default());
        assert_eq!(params.max, 500);
        assert_eq!(params.duration, 5);
        assert_eq!(rules.find_name("api:admin"), Some("api-admin"));
        assert_eq!(rules.find_name("api:user42"), Some("api"));
    }

    #[test]
    fn test_extra_segments_fall_back_to_deepest_match() {
        let rules = LimitRules::from_yaml(RULES).unwrap();
        let params = rules.find_limit("api:user42:extra", LimitParams::default());
        assert_eq!(params.max, 20);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let yaml = r#"
rules:
  - key: api
    rate: 0
"#;
        assert!(matches!(LimitRules::from_yaml(yaml), Err(SluiceError::Config(_))));

        let yaml = r#"
rules:
  - key: api
    rules:
      - key: x
        max: 0
"#;
        assert!(matches!(LimitRules::from_yaml(yaml), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_empty_rules() {
        let rules = LimitRules::from_yaml("rules: []").unwrap();
        assert!(rules.rules.is_empty());
        assert_eq!(rules.find_limit("anything", LimitParams::default()), LimitParams::default());
    }
}
