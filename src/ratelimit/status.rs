//! The admission decision returned to every caller.

use serde::{Deserialize, Serialize};

/// Result of an admission check.
///
/// `reset_at` is in unix seconds, `retry_after` in seconds and zero unless
/// `limited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub limited: bool,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub retry_after: u64,
}

impl LimitStatus {
    /// A status that admits the request (or would admit the next one).
    pub fn admitted(current: u64, limit: u64, reset_at_ms: u64) -> Self {
        Self {
            limited: false,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_at: reset_at_ms.div_ceil(1000),
            retry_after: 0,
        }
    }

    /// A status that rejects the request.
    ///
    /// `retry_after` is rounded up to whole seconds and never reported as zero.
    pub fn denied(current: u64, limit: u64, reset_at_ms: u64, retry_after_ms: u64) -> Self {
        Self {
            limited: true,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_at: reset_at_ms.div_ceil(1000),
            retry_after: retry_after_ms.div_ceil(1000).max(1),
        }
    }

    /// The status reported when the store cannot be reached.
    pub fn fail_open(limit: u64, window_ms: u64, now_ms: u64) -> Self {
        Self::admitted(0, limit, now_ms.saturating_add(window_ms))
    }
}
