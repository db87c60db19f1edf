//! Token bucket admission.
//!
//! The bucket holds up to `max_requests` tokens and refills continuously at
//! `max_requests` tokens per `window_ms`. A missing record is a full bucket.

use crate::ratelimit::options::ResolvedLimit;
use crate::ratelimit::record::StoredRecord;
use crate::ratelimit::status::LimitStatus;
use crate::ratelimit::strategy::{clamp_now, Strategy};
use crate::store::{IncrementRequest, StoreUpdate};

/// The time to refill up to. Never earlier than the record's last refill.
fn refill_time(record: Option<&StoredRecord>, now_ms: u64) -> u64 {
    let now_ms = clamp_now(record, now_ms);
    record
        .and_then(|r| r.last_refill)
        .map_or(now_ms, |last_refill| now_ms.max(last_refill))
}

/// Tokens available at `now_ms` after refilling since the last update.
fn refill(
    record: Option<&StoredRecord>,
    max_requests: u64,
    window_ms: u64,
    now_ms: u64,
) -> f64 {
    let capacity = max_requests as f64;
    match record {
        Some(r) => {
            let tokens = r.tokens_remaining.unwrap_or(capacity);
            let last_refill = r.last_refill.unwrap_or(r.window_start);
            let elapsed = now_ms.saturating_sub(last_refill) as f64;
            (tokens + elapsed / window_ms as f64 * capacity).min(capacity)
        }
        None => capacity,
    }
}

/// Milliseconds needed to accumulate `needed` more tokens.
fn time_for(needed: f64, max_requests: u64, window_ms: u64) -> u64 {
    if needed <= 0.0 {
        return 0;
    }
    (needed / max_requests as f64 * window_ms as f64).ceil() as u64
}

fn decide(
    tokens: f64,
    amount: u64,
    max_requests: u64,
    window_ms: u64,
    now_ms: u64,
    admitted: bool,
) -> LimitStatus {
    let remaining = tokens.max(0.0).floor() as u64;
    let current = max_requests.saturating_sub(remaining);
    let full_at = now_ms + time_for(max_requests as f64 - tokens, max_requests, window_ms);

    if admitted {
        LimitStatus::admitted(current, max_requests, full_at)
    } else {
        let retry_ms = time_for(amount as f64 - tokens, max_requests, window_ms);
        LimitStatus::denied(current, max_requests, full_at, retry_ms)
    }
}

pub(super) fn advance(
    existing: Option<&StoredRecord>,
    key: &str,
    request: &IncrementRequest,
) -> StoreUpdate {
    let now_ms = refill_time(existing, request.now_ms);
    let mut tokens = refill(existing, request.max_requests, request.window_ms, now_ms);

    let admitted = tokens >= request.amount as f64;
    if admitted {
        tokens -= request.amount as f64;
    }

    let missing = request.max_requests as f64 - tokens;
    let full_at = now_ms + time_for(missing, request.max_requests, request.window_ms);

    StoreUpdate {
        record: StoredRecord {
            key: key.to_string(),
            strategy: Strategy::TokenBucket,
            count: request.max_requests.saturating_sub(tokens.floor() as u64),
            previous_count: 0,
            max_requests: request.max_requests,
            window_ms: request.window_ms,
            window_start: now_ms,
            window_end: full_at,
            expires_at: full_at,
            tokens_remaining: Some(tokens),
            last_refill: Some(now_ms),
            scope: request.scope.clone(),
            updated_at: now_ms,
        },
        admitted,
    }
}

pub(super) fn status(
    record: Option<&StoredRecord>,
    limit: &ResolvedLimit,
    now_ms: u64,
) -> LimitStatus {
    let now_ms = refill_time(record, now_ms);
    let tokens = refill(record, limit.max_requests, limit.window_ms, now_ms);
    let admitted = tokens >= limit.amount as f64;
    decide(tokens, limit.amount, limit.max_requests, limit.window_ms, now_ms, admitted)
}

pub(super) fn outcome(update: &StoreUpdate, now_ms: u64) -> LimitStatus {
    let record = &update.record;
    let tokens = record.tokens_remaining.unwrap_or(0.0);
    let now_ms = refill_time(Some(record), now_ms);
    // The denied amount is not recorded; a single unit is what the caller
    // needs before anything can be admitted again.
    decide(tokens, 1, record.max_requests, record.window_ms, now_ms, update.admitted)
}
