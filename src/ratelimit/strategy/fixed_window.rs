//! Fixed window counting.
//!
//! Windows are aligned to multiples of `window_ms` since the epoch and reset
//! abruptly. A burst straddling a boundary can admit up to twice the limit in
//! a short span; that is inherent to the algorithm.

use super::{aligned_window, clamp_now};
use crate::ratelimit::options::ResolvedLimit;
use crate::ratelimit::record::StoredRecord;
use crate::ratelimit::status::LimitStatus;
use crate::ratelimit::strategy::Strategy;
use crate::store::{IncrementRequest, StoreUpdate};

fn count_in_window(record: Option<&StoredRecord>, window_start: u64) -> u64 {
    record
        .filter(|r| r.window_start == window_start)
        .map_or(0, |r| r.count)
}

pub(super) fn advance(
    existing: Option<&StoredRecord>,
    key: &str,
    request: &IncrementRequest,
) -> StoreUpdate {
    let now_ms = clamp_now(existing, request.now_ms);
    let (window_start, window_end) = aligned_window(now_ms, request.window_ms);
    let count = count_in_window(existing, window_start);

    let admitted = count.saturating_add(request.amount) <= request.max_requests;
    let count = if admitted { count + request.amount } else { count };

    StoreUpdate {
        record: StoredRecord {
            key: key.to_string(),
            strategy: Strategy::FixedWindow,
            count,
            previous_count: 0,
            max_requests: request.max_requests,
            window_ms: request.window_ms,
            window_start,
            window_end,
            expires_at: window_end,
            tokens_remaining: None,
            last_refill: None,
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
    let now_ms = clamp_now(record, now_ms);
    let (window_start, window_end) = aligned_window(now_ms, limit.window_ms);
    let count = count_in_window(record, window_start);

    if count.saturating_add(limit.amount) > limit.max_requests {
        LimitStatus::denied(count, limit.max_requests, window_end, window_end - now_ms)
    } else {
        LimitStatus::admitted(count, limit.max_requests, window_end)
    }
}

pub(super) fn outcome(update: &StoreUpdate, now_ms: u64) -> LimitStatus {
    let record = &update.record;
    let now_ms = clamp_now(Some(record), now_ms);
    if update.admitted {
        LimitStatus::admitted(record.count, record.max_requests, record.window_end)
    } else {
        LimitStatus::denied(
            record.count,
            record.max_requests,
            record.window_end,
            record.window_end.saturating_sub(now_ms),
        )
    }
}
