//! Policy injection surface (spec.md §4.8 "Policies", §9 "Policy
//! injection"): each policy is exposed as a capability trait with the
//! minimum surface it needs, composed into the client rather than
//! inherited from, the way the teacher composes `Authenticator` and
//! `TcpClient` implementations behind small traits/enums instead of a
//! class hierarchy.

pub mod address_translator;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod speculative_execution;
pub mod timestamp_generator;

use std::sync::Arc;

use address_translator::{AddressTranslator, IdentityAddressTranslator};
use load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use retry::{DefaultRetryPolicy, RetryPolicy};
use speculative_execution::{NoSpeculativeExecutionPolicy, SpeculativeExecutionPolicy};
use timestamp_generator::{MonotonicTimestampGenerator, TimestampGenerator};

/// The bag of policies resolved for a client or execution profile
/// (spec.md §3 "Execution Profile"). Cloned cheaply via `Arc`.
#[derive(Clone)]
pub struct Policies {
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    pub speculative_execution: Arc<dyn SpeculativeExecutionPolicy>,
    pub address_translator: Arc<dyn AddressTranslator>,
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
}

impl std::fmt::Debug for Policies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policies").finish_non_exhaustive()
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            load_balancing: Arc::new(RoundRobinPolicy::default()),
            retry: Arc::new(DefaultRetryPolicy),
            reconnection: Arc::new(ExponentialReconnectionPolicy::default()),
            speculative_execution: Arc::new(NoSpeculativeExecutionPolicy),
            address_translator: Arc::new(IdentityAddressTranslator),
            timestamp_generator: Some(Arc::new(MonotonicTimestampGenerator::default())),
        }
    }
}
