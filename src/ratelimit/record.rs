//! Persistent counting state for a single key.

use serde::{Deserialize, Serialize};

use super::strategy::Strategy;

/// Provenance metadata attached to a record.
///
/// Never consulted by the counting logic; kept for audit and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl Scope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// The authoritative counting state for one key and one active window.
///
/// Field semantics depend on `strategy`:
///
/// | field                | fixed window         | sliding window            | token bucket          |
/// |----------------------|----------------------|---------------------------|-----------------------|
/// | `count`              | units in window      | units in current window   | `max - floor(tokens)` |
/// | `previous_count`     | unused               | units in previous window  | unused                |
/// | `window_start`       | aligned start        | aligned start             | last refill           |
/// | `window_end`         | aligned end          | aligned end               | bucket full again     |
/// | `tokens_remaining`   | `None`               | `None`                    | fractional tokens     |
///
/// A record is only ever produced by its strategy's transition function, and
/// a record written by one strategy is re-initialised, never reinterpreted,
/// by another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub strategy: Strategy,
    pub count: u64,
    #[serde(default)]
    pub previous_count: u64,
    pub max_requests: u64,
    pub window_ms: u64,
    pub window_start: u64,
    pub window_end: u64,
    /// Instant (ms) after which the record no longer affects any decision.
    pub expires_at: u64,
    #[serde(default)]
    pub tokens_remaining: Option<f64>,
    #[serde(default)]
    pub last_refill: Option<u64>,
    #[serde(default)]
    pub scope: Scope,
    pub updated_at: u64,
}

impl StoredRecord {
    /// Whether the record is past its useful life at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    /// Whether this record was written by `strategy` under the same policy.
    pub fn matches(&self, strategy: Strategy, max_requests: u64, window_ms: u64) -> bool {
        self.strategy == strategy
            && self.max_requests == max_requests
            && self.window_ms == window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StoredRecord {
        StoredRecord {
            key: "fixed_window|user:42".to_string(),
            strategy: Strategy::FixedWindow,
            count: 3,
            previous_count: 0,
            max_requests: 5,
            window_ms: 1_000,
            window_start: 1_000,
            window_end: 2_000,
            expires_at: 2_000,
            tokens_remaining: None,
            last_refill: None,
            scope: Scope::user("42").with_ip("10.0.0.1"),
            updated_at: 1_200,
        }
    }

    #[test]
    fn test_expiry_is_inclusive_of_expires_at() {
        let record = record();
        assert!(!record.is_expired(1_999));
        assert!(record.is_expired(2_000));
    }

    #[test]
    fn test_matches_requires_same_policy() {
        let record = record();
        assert!(record.matches(Strategy::FixedWindow, 5, 1_000));
        assert!(!record.matches(Strategy::SlidingWindow, 5, 1_000));
        assert!(!record.matches(Strategy::FixedWindow, 6, 1_000));
        assert!(!record.matches(Strategy::FixedWindow, 5, 2_000));
    }

    #[test]
    fn test_scope_is_omitted_when_empty() {
        let json = serde_json::to_value(Scope::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));

        let json = serde_json::to_value(Scope::user("7").with_tenant("acme")).unwrap();
        assert_eq!(json, serde_json::json!({"user_id": "7", "tenant_id": "acme"}));
    }
}
