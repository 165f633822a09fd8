//! Speculative execution policy (spec.md §4.6 step 6, §9).

use std::time::Duration;

/// A lazy sequence of delays after which another copy of the request is
/// sent to the next host in the query plan.
pub trait SpeculativeExecutionPlan: Send {
    /// Returns `None` once no further speculative attempts should be made.
    fn next_execution(&mut self) -> Option<Duration>;
}

/// `SpeculativeExecutionPolicy { newPlan }` (spec.md §9).
pub trait SpeculativeExecutionPolicy: Send + Sync + std::fmt::Debug {
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan>;
}

/// Never speculates; the default, matching a configuration where
/// speculative execution is opt-in.
#[derive(Debug, Default)]
pub struct NoSpeculativeExecutionPolicy;

struct NoPlan;
impl SpeculativeExecutionPlan for NoPlan {
    fn next_execution(&mut self) -> Option<Duration> {
        None
    }
}

impl SpeculativeExecutionPolicy for NoSpeculativeExecutionPolicy {
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan> {
        Box::new(NoPlan)
    }
}

/// Fires up to `max_executions - 1` additional attempts, each `delay`
/// apart.
#[derive(Debug, Clone)]
pub struct ConstantSpeculativeExecutionPolicy {
    pub delay: Duration,
    pub max_executions: u32,
}

struct ConstantPlan {
    delay: Duration,
    remaining: u32,
}
impl SpeculativeExecutionPlan for ConstantPlan {
    fn next_execution(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            None
        } else {
            self.remaining -= 1;
            Some(self.delay)
        }
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan> {
        Box::new(ConstantPlan {
            delay: self.delay,
            remaining: self.max_executions.saturating_sub(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_plan_yields_bounded_attempts() {
        let policy = ConstantSpeculativeExecutionPolicy {
            delay: Duration::from_millis(50),
            max_executions: 3,
        };
        let mut plan = policy.new_plan();
        assert_eq!(plan.next_execution(), Some(Duration::from_millis(50)));
        assert_eq!(plan.next_execution(), Some(Duration::from_millis(50)));
        assert_eq!(plan.next_execution(), None);
    }
}
