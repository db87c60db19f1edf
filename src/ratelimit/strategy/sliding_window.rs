//! Sliding window counting.
//!
//! Approximates a trailing `window_ms` interval by weighting the previous
//! aligned window's count by the share of it still inside the interval:
//!
//! `effective = current + previous * (1 - elapsed / window_ms)`
//!
//! A call for `amount` units is admitted iff `effective + amount - 1 < max`.

use super::{aligned_window, clamp_now};
use crate::ratelimit::options::ResolvedLimit;
use crate::ratelimit::record::StoredRecord;
use crate::ratelimit::status::LimitStatus;
use crate::ratelimit::strategy::Strategy;
use crate::store::{IncrementRequest, StoreUpdate};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Windows {
    current: u64,
    previous: u64,
    window_start: u64,
    window_end: u64,
}

impl Windows {
    fn at(record: Option<&StoredRecord>, window_ms: u64, now_ms: u64) -> Self {
        let (window_start, window_end) = aligned_window(now_ms, window_ms);
        let (current, previous) = match record {
            Some(r) if r.window_start == window_start => (r.count, r.previous_count),
            Some(r) if r.window_start.saturating_add(window_ms) == window_start => (0, r.count),
            _ => (0, 0),
        };

        Self {
            current,
            previous,
            window_start,
            window_end,
        }
    }

    fn effective(&self, window_ms: u64, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.window_start) as f64 / window_ms as f64;
        self.current as f64 + self.previous as f64 * (1.0 - elapsed)
    }

    /// Milliseconds until a call for `amount` units would be admitted.
    fn retry_after_ms(&self, amount: u64, max: u64, window_ms: u64, now_ms: u64) -> u64 {
        // Admitted once `effective < threshold`.
        let threshold = max as f64 - (amount.max(1) - 1) as f64;
        let current = self.current as f64;
        let previous = self.previous as f64;
        let window = window_ms as f64;

        let target = if threshold <= 0.0 {
            // Never admitted; report when both windows have drained.
            self.window_end as f64 + window
        } else if current < threshold {
            if previous <= 0.0 {
                return 0;
            }
            self.window_start as f64 + window * (1.0 - (threshold - current) / previous)
        } else {
            // The current window must become the previous one and decay.
            self.window_end as f64 + window * (1.0 - threshold / current)
        };

        (target.ceil() as u64 + 1).saturating_sub(now_ms)
    }
}

fn admits(effective: f64, amount: u64, max_requests: u64) -> bool {
    effective + ((amount.max(1) - 1) as f64) < max_requests as f64
}

pub(super) fn advance(
    existing: Option<&StoredRecord>,
    key: &str,
    request: &IncrementRequest,
) -> StoreUpdate {
    let now_ms = clamp_now(existing, request.now_ms);
    let windows = Windows::at(existing, request.window_ms, now_ms);
    let effective = windows.effective(request.window_ms, now_ms);

    let admitted = admits(effective, request.amount, request.max_requests);
    let count = if admitted {
        windows.current + request.amount
    } else {
        windows.current
    };

    StoreUpdate {
        record: StoredRecord {
            key: key.to_string(),
            strategy: Strategy::SlidingWindow,
            count,
            previous_count: windows.previous,
            max_requests: request.max_requests,
            window_ms: request.window_ms,
            window_start: windows.window_start,
            window_end: windows.window_end,
            // The current window still weighs into the next one.
            expires_at: windows.window_end.saturating_add(request.window_ms),
            tokens_remaining: None,
            last_refill: None,
            scope: request.scope.clone(),
            updated_at: now_ms,
        },
        admitted,
    }
}

fn decide(
    windows: &Windows,
    admitted: bool,
    amount: u64,
    max_requests: u64,
    window_ms: u64,
    now_ms: u64,
) -> LimitStatus {
    let current = windows.effective(window_ms, now_ms).ceil() as u64;
    if admitted {
        LimitStatus::admitted(current, max_requests, windows.window_end)
    } else {
        let retry_ms = windows.retry_after_ms(amount, max_requests, window_ms, now_ms);
        LimitStatus::denied(
            current,
            max_requests,
            windows.window_end.max(now_ms + retry_ms),
            retry_ms,
        )
    }
}

pub(super) fn status(
    record: Option<&StoredRecord>,
    limit: &ResolvedLimit,
    now_ms: u64,
) -> LimitStatus {
    let now_ms = clamp_now(record, now_ms);
    let windows = Windows::at(record, limit.window_ms, now_ms);
    let effective = windows.effective(limit.window_ms, now_ms);
    let admitted = admits(effective, limit.amount, limit.max_requests);
    decide(&windows, admitted, limit.amount, limit.max_requests, limit.window_ms, now_ms)
}

pub(super) fn outcome(update: &StoreUpdate, now_ms: u64) -> LimitStatus {
    let record = &update.record;
    let now_ms = clamp_now(Some(record), now_ms);
    let windows = Windows::at(Some(record), record.window_ms, now_ms);
    // The denied amount is not recorded; report when a single unit fits.
    decide(&windows, update.admitted, 1, record.max_requests, record.window_ms, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::record::Scope;

    const WINDOW: u64 = 60_000;

    fn request(max_requests: u64, now_ms: u64) -> IncrementRequest {
        IncrementRequest {
            strategy: Strategy::SlidingWindow,
            max_requests,
            window_ms: WINDOW,
            amount: 1,
            now_ms,
            scope: Scope::default(),
        }
    }

    fn run(record: &mut Option<StoredRecord>, max_requests: u64, now_ms: u64) -> LimitStatus {
        let update = advance(record.as_ref(), "k", &request(max_requests, now_ms));
        let status = outcome(&update, now_ms);
        *record = Some(update.record);
        status
    }

    #[test]
    fn test_admits_up_to_limit_in_one_window() {
        let mut record = None;
        let admitted = (0..15).filter(|_| !run(&mut record, 10, 1_000).limited).count();
        assert_eq!(admitted, 10);
        assert_eq!(record.unwrap().count, 10);
    }

    #[test]
    fn test_previous_window_is_weighted() {
        let mut record = None;
        for _ in 0..10 {
            run(&mut record, 10, 30_000);
        }

        // Halfway through the next window, half of the previous count remains.
        let status = run(&mut record, 10, WINDOW + WINDOW / 2);
        assert!(!status.limited);
        let record_ref = record.as_ref().unwrap();
        assert_eq!(record_ref.previous_count, 10);
        assert_eq!(record_ref.count, 1);
        assert_eq!(status.current, 6);
        assert_eq!(status.remaining, 4);
    }

    #[test]
    fn test_boundary_burst_is_rejected() {
        let mut record = None;
        let first = (0..100).filter(|_| !run(&mut record, 100, WINDOW - 1).limited).count();
        let second = (0..100).filter(|_| !run(&mut record, 100, WINDOW).limited).count();
        assert_eq!(first, 100);
        assert_eq!(second, 0);
    }

    #[test]
    fn test_stale_record_is_forgotten() {
        let mut record = None;
        for _ in 0..10 {
            run(&mut record, 10, 0);
        }
        let status = run(&mut record, 10, 2 * WINDOW);
        assert!(!status.limited);
        assert_eq!(status.current, 1);
        assert_eq!(record.unwrap().previous_count, 0);
    }

    #[test]
    fn test_trailing_interval_bound_under_steady_overload() {
        // Arrivals at twice the permitted rate for five windows.
        let mut record = None;
        let mut admitted_at = Vec::new();
        let mut now = 0;
        while now < 5 * WINDOW {
            if !run(&mut record, 100, now).limited {
                admitted_at.push(now);
            }
            now += 300;
        }

        for &end in &admitted_at {
            let in_interval = admitted_at
                .iter()
                .filter(|&&t| t + WINDOW > end && t <= end)
                .count();
            assert!(in_interval <= 103, "{} admitted in window ending at {}", in_interval, end);
        }
    }

    #[test]
    fn test_retry_after_when_current_window_full() {
        let mut record = None;
        for _ in 0..10 {
            run(&mut record, 10, 0);
        }
        let status = run(&mut record, 10, 0);
        assert!(status.limited);
        // A full current window frees up just after the next boundary.
        assert_eq!(status.retry_after, 61);
    }

    #[test]
    fn test_retry_after_when_previous_window_dominates() {
        let mut record = None;
        for _ in 0..10 {
            run(&mut record, 10, 0);
        }
        let status = run(&mut record, 10, WINDOW);
        assert!(status.limited);
        // effective = 10 * (1 - f) < 10 once any time has passed.
        assert_eq!(status.retry_after, 1);
    }

    #[test]
    fn test_status_does_not_mutate() {
        let limit = ResolvedLimit {
            strategy: Strategy::SlidingWindow,
            max_requests: 10,
            window_ms: WINDOW,
            amount: 1,
            scope: Scope::default(),
        };
        let mut record = None;
        for _ in 0..4 {
            run(&mut record, 10, 100);
        }
        let before = record.clone();
        let status = status(record.as_ref(), &limit, 200);
        assert_eq!(status.current, 4);
        assert_eq!(status.remaining, 6);
        assert_eq!(record, before);
    }

    fn limit(amount: u64) -> ResolvedLimit {
        ResolvedLimit {
            strategy: Strategy::SlidingWindow,
            max_requests: 10,
            window_ms: WINDOW,
            amount,
            scope: Scope::default(),
        }
    }

    #[test]
    fn test_retry_after_accounts_for_amount() {
        let mut record = None;
        for _ in 0..8 {
            run(&mut record, 10, 0);
        }

        let denied = status(record.as_ref(), &limit(3), 0);
        assert!(denied.limited);
        assert_eq!(denied.retry_after, 61);

        // Three units fit once the eight carried over have decayed at all.
        assert!(status(record.as_ref(), &limit(3), WINDOW).limited);
        assert!(!status(record.as_ref(), &limit(3), WINDOW + 1).limited);
        assert!(status(record.as_ref(), &limit(3), 45_001).limited);
    }

    #[test]
    fn test_amount_above_limit_is_never_admitted() {
        let status = status(None, &limit(11), 0);
        assert!(status.limited);
        assert_eq!(status.retry_after, 121);
    }

    #[test]
    fn test_late_write_keeps_current_window_count() {
        let mut record = None;
        for _ in 0..10 {
            run(&mut record, 10, WINDOW);
        }

        let status = run(&mut record, 10, WINDOW - 1);
        assert!(status.limited);
        let stored = record.as_ref().unwrap();
        assert_eq!(stored.window_start, WINDOW);
        assert_eq!(stored.count, 10);
        assert_eq!(stored.previous_count, 0);
    }
}
