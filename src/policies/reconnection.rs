//! Reconnection policy (spec.md §4.9 / GLOSSARY, §9 "Design Notes").
//!
//! A `ReconnectionPolicy` hands out a fresh [`ReconnectionSchedule`] — a
//! lazy sequence of delays — each time something (a Host, the Control
//! Connection) starts a new reconnection attempt sequence. The schedule
//! itself is stateful and is reset on every successful connection.

use std::time::Duration;

/// `ReconnectionPolicy { newSchedule }` (spec.md §9).
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    fn new_schedule(&self) -> ReconnectionSchedule;
}

/// Exponential backoff with jitter, bounded by a max delay (spec.md §9
/// Supplemented section: "Reconnection schedule shape").
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_secs(60))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> ReconnectionSchedule {
        ReconnectionSchedule::new(self.base_delay, self.max_delay)
    }
}

/// A lazy sequence of backoff delays owned by one Host or one Control
/// Connection reconnection loop (GLOSSARY). `next()` advances and returns
/// the next delay; `reset()` is called on every successful (re)connection.
#[derive(Debug, Clone)]
pub struct ReconnectionSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectionSchedule {
    fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// A short, low-jitter schedule suitable for unit tests.
    pub fn for_test() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(10))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next(&mut self) -> Duration {
        let exp = self.attempt.min(20);
        self.attempt += 1;
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter_frac = rand::random::<f64>() * 0.25;
        capped.mul_f64(1.0 - jitter_frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_bounded() {
        let mut schedule = ReconnectionSchedule::new(Duration::from_millis(10), Duration::from_millis(100));
        let first = schedule.next();
        let second = schedule.next();
        assert!(first <= Duration::from_millis(10));
        assert!(second <= Duration::from_millis(100));
        for _ in 0..30 {
            assert!(schedule.next() <= Duration::from_millis(100));
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut schedule = ReconnectionSchedule::new(Duration::from_millis(10), Duration::from_millis(1000));
        for _ in 0..5 {
            schedule.next();
        }
        schedule.reset();
        assert!(schedule.next() <= Duration::from_millis(10));
    }
}
