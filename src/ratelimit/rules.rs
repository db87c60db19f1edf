//! Policy rules and key matching.
//!
//! Rules let operators assign limits to key namespaces without every caller
//! passing explicit options. They form a tree keyed on descriptor entries, and
//! the most specific matching rule wins.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::descriptor::KeyDescriptor;
use super::strategy::Strategy;
use crate::error::{FloodgateError, Result};

/// The complete set of policy rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Top-level policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// A node in the policy tree.
///
/// - `key` must equal the descriptor entry name at this depth
/// - `value`, when set, must equal the entry value; otherwise any value matches
/// - `rate_limit` applies at this depth
/// - `policies` refine the match with the next descriptor entry
///
/// A `value` may also equal the rest of the key from this entry's value on,
/// which is how values containing `:` are matched: `value: "2001:db8::1"`
/// under `key: ip` matches `"ip:2001:db8::1"`. Such a match consumes the key,
/// so `policies` below it are not consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// The limit a rule assigns. Unset fields fall through to the service defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Explicit window length; takes precedence over `unit`.
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub name: Option<String>,
}

impl RateLimitRule {
    /// The window length this rule specifies, if any.
    pub fn window_ms(&self) -> Option<u64> {
        self.window_ms
            .or_else(|| self.unit.map(|unit| unit.duration().as_millis() as u64))
    }
}

/// Shorthand window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl PolicyRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a document with a top-level `policies` list or a bare
    /// list of policies.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policies) = serde_yaml::from_str::<Vec<PolicyConfig>>(yaml) {
            return Ok(Self { policies });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy rules: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Find the most specific rule matching a key.
    pub fn find(&self, key: &str) -> Option<&RateLimitRule> {
        if self.policies.is_empty() {
            return None;
        }
        let descriptor = KeyDescriptor::parse(key);
        Self::find_in_policies(&self.policies, &descriptor, 0)
    }

    fn find_in_policies<'a>(
        policies: &'a [PolicyConfig],
        descriptor: &KeyDescriptor,
        entry_index: usize,
    ) -> Option<&'a RateLimitRule> {
        let (name, value) = descriptor.entries.get(entry_index)?;
        let mut best_match: Option<&RateLimitRule> = None;

        for policy in policies {
            if &policy.key != name {
                continue;
            }

            let (value_matches, consumes_key) = match &policy.value {
                Some(v) if v == value => (true, false),
                Some(v) => (descriptor.value_to_end(entry_index) == Some(v.as_str()), true),
                None => (true, false),
            };

            if !value_matches {
                continue;
            }

            if !consumes_key && !policy.policies.is_empty() {
                if let Some(child) =
                    Self::find_in_policies(&policy.policies, descriptor, entry_index + 1)
                {
                    return Some(child);
                }
            }

            // An exact value match outranks a wildcard sibling at the same depth.
            if let Some(ref limit) = policy.rate_limit {
                if policy.value.is_some() || best_match.is_none() {
                    best_match = Some(limit);
                }
            }
        }

        best_match
    }
}
