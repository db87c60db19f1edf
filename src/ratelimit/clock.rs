//! Time sources for window and refill calculations.

/// Wall clock abstraction so window math can be driven deterministically in tests.
///
/// Timestamps are unix milliseconds. Window alignment depends on the epoch, so
/// implementations must be wall-clock based rather than monotonic.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        // Before-epoch system time is clamped rather than wrapped.
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
