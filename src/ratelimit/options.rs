//! Per-call options, runtime defaults and option resolution.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::Scope;
use super::rules::RateLimitRule;
use super::strategy::Strategy;

const DEFAULT_WINDOW_MS: u64 = 60_000;
const DEFAULT_MAX_REQUESTS: u64 = 100;

/// Options supplied with a single check. Unset fields fall back to the
/// matching policy rule and then to the service defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOptions {
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Units consumed by one call; zero is treated as one.
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub scope: Scope,
}

impl LimitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Default policy applied to options left unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefaults {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default)]
    pub strategy: Strategy,
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
            strategy: Strategy::default(),
        }
    }
}

impl LimitDefaults {
    /// Apply a partial update, keeping the current value for anything invalid.
    ///
    /// Unknown strategy names and zero limits are ignored with a warning.
    pub fn apply(&mut self, update: &DefaultsUpdate) {
        if let Some(window_ms) = update.window_ms {
            if window_ms > 0 {
                self.window_ms = window_ms;
            } else {
                warn!(window_ms, "Ignoring non-positive default window");
            }
        }

        if let Some(max_requests) = update.max_requests {
            if max_requests > 0 {
                self.max_requests = max_requests;
            } else {
                warn!(max_requests, "Ignoring non-positive default request limit");
            }
        }

        if let Some(ref name) = update.strategy {
            match name.parse::<Strategy>() {
                Ok(strategy) => self.strategy = strategy,
                Err(_) => warn!(strategy = %name, "Ignoring unknown default strategy"),
            }
        }
    }

    /// Replace invalid values with the built-in defaults.
    pub fn sanitized(self) -> Self {
        let mut defaults = Self::default();
        defaults.apply(&DefaultsUpdate {
            window_ms: Some(self.window_ms),
            max_requests: Some(self.max_requests),
            strategy: Some(self.strategy.to_string()),
        });
        defaults
    }
}

/// A partial update to [`LimitDefaults`].
///
/// The strategy is taken by name so that callers passing an unknown name get
/// the documented "ignored" behaviour instead of a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultsUpdate {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Fully resolved parameters for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub strategy: Strategy,
    pub max_requests: u64,
    pub window_ms: u64,
    pub amount: u64,
    pub scope: Scope,
}

impl ResolvedLimit {
    /// Resolve options in precedence order: explicit option, policy rule, defaults.
    ///
    /// Zero `max_requests` or `window_ms` at any level is skipped in favour of
    /// the next level.
    pub fn resolve(
        options: &LimitOptions,
        rule: Option<&RateLimitRule>,
        defaults: &LimitDefaults,
    ) -> Self {
        let max_requests = pick_positive(
            "max_requests",
            [options.max_requests, rule.and_then(|r| r.max_requests)],
            defaults.max_requests,
        );
        let window_ms = pick_positive(
            "window_ms",
            [options.window_ms, rule.and_then(RateLimitRule::window_ms)],
            defaults.window_ms,
        );
        let strategy = options
            .strategy
            .or_else(|| rule.and_then(|r| r.strategy))
            .unwrap_or(defaults.strategy);

        Self {
            strategy,
            max_requests,
            window_ms,
            amount: options.amount.unwrap_or(1).max(1),
            scope: options.scope.clone(),
        }
    }
}

fn pick_positive(field: &'static str, candidates: [Option<u64>; 2], fallback: u64) -> u64 {
    for value in candidates.into_iter().flatten() {
        if value > 0 {
            return value;
        }
        warn!(field, "Ignoring non-positive limit option");
    }
    fallback
}
