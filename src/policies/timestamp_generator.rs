//! Client-side timestamp generation (spec.md §4.6 "Timestamps").
//!
//! When the negotiated protocol version supports timestamp-in-flags and a
//! generator is configured, the Request Handler stamps every request with
//! a microsecond timestamp from here rather than letting the server assign
//! one, so that retries and speculative duplicates keep a stable write
//! ordering.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// `TimestampGenerator { next }` (spec.md §9).
pub trait TimestampGenerator: Send + Sync + std::fmt::Debug {
    fn next(&self) -> i64;
}

/// Monotonic generator: maintains `last = max(last, system-clock-us)` and
/// bumps by 1 on ties, warning if the system clock drifts far enough
/// behind `last` to suggest a problem (spec.md §4.6).
#[derive(Debug)]
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    warn_threshold_micros: i64,
}

impl MonotonicTimestampGenerator {
    pub fn new(warn_threshold: std::time::Duration) -> Self {
        Self {
            last: AtomicI64::new(0),
            warn_threshold_micros: warn_threshold.as_micros() as i64,
        }
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(1))
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> i64 {
        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let drift = last - now_micros;
            if drift > self.warn_threshold_micros {
                log::warn!(
                    "timestamp generator drifted {drift}us ahead of the system clock; \
                     client clocks across the cluster may be out of sync"
                );
            }
            let candidate = if now_micros > last { now_micros } else { last + 1 };
            if self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing_even_on_ties() {
        let generator = MonotonicTimestampGenerator::default();
        let mut last = generator.next();
        for _ in 0..1000 {
            let next = generator.next();
            assert!(next > last);
            last = next;
        }
    }
}
