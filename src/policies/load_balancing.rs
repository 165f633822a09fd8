//! Load-balancing policy (spec.md §9 / §4.6 step 1).

use std::sync::Arc;

use crate::host::{Distance, Endpoint, Host};
use crate::host_map::HostMap;

/// A lazy ordered sequence of hosts a request is allowed to try, in order
/// (GLOSSARY "Query Plan").
pub type QueryPlan = Vec<Arc<Host>>;

/// `LoadBalancingPolicy { init, newQueryPlan, getDistance }` (spec.md §9).
#[async_trait::async_trait]
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    async fn init(&self, hosts: &HostMap) {
        let _ = hosts;
    }

    /// Builds a query plan for one logical request. `routing_key` and
    /// `keyspace` are opaque hints a token-aware implementation would use;
    /// the base policies here ignore them.
    async fn new_query_plan(&self, hosts: &HostMap) -> QueryPlan;

    fn distance(&self, info: &crate::host::HostInfo, local_dc: Option<&str>) -> Distance;
}

/// Round-robins over every up, non-ignored host; local hosts first.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    local_dc: Option<String>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new(local_dc: Option<String>) -> Self {
        Self {
            local_dc,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LoadBalancingPolicy for RoundRobinPolicy {
    async fn new_query_plan(&self, hosts: &HostMap) -> QueryPlan {
        let mut snapshot: Vec<Arc<Host>> = hosts.values().await;
        snapshot.retain(|h| h.is_up());
        if snapshot.is_empty() {
            return snapshot;
        }
        let start = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % snapshot.len();
        snapshot.rotate_left(start);
        snapshot
    }

    fn distance(&self, info: &crate::host::HostInfo, local_dc: Option<&str>) -> Distance {
        let dc = local_dc.or(self.local_dc.as_deref());
        match (dc, info.datacenter.as_deref()) {
            (Some(local), Some(host_dc)) if local == host_dc => Distance::Local,
            (Some(_), Some(_)) => Distance::Remote,
            _ => Distance::Local,
        }
    }
}

/// Prefers hosts in `local_dc`, falling back to remote hosts only after
/// every local host has been tried.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    cursor: std::sync::atomic::AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    async fn new_query_plan(&self, hosts: &HostMap) -> QueryPlan {
        let snapshot: Vec<Arc<Host>> = hosts.values().await;
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for host in snapshot {
            if !host.is_up() {
                continue;
            }
            let info = host.info().await;
            if info.datacenter.as_deref() == Some(self.local_dc.as_str()) {
                local.push(host);
            } else {
                remote.push(host);
            }
        }
        let rotate = |v: &mut Vec<Arc<Host>>| {
            if !v.is_empty() {
                let start = self
                    .cursor
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % v.len();
                v.rotate_left(start);
            }
        };
        rotate(&mut local);
        rotate(&mut remote);
        local.extend(remote);
        local
    }

    fn distance(&self, info: &crate::host::HostInfo, _local_dc: Option<&str>) -> Distance {
        if info.datacenter.as_deref() == Some(self.local_dc.as_str()) {
            Distance::Local
        } else {
            Distance::Remote
        }
    }
}

/// Returns the endpoints of a plan, for diagnostics/tests.
pub fn plan_endpoints(plan: &QueryPlan) -> Vec<Endpoint> {
    plan.iter().map(|h| h.endpoint()).collect()
}
