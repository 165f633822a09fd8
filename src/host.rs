//! Per-node state (spec.md §3 "Host", §4.3).
//!
//! A `Host` is a thin façade over its [`crate::pool::HostConnectionPool`]
//! plus the health-tracking fields the Control Connection and Request
//! Handler read: datacenter/rack/tokens for load balancing, up/down status
//! for query-plan filtering, and a reconnection schedule for backoff.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::conn::ConnectionConfig;
use crate::error::DriverResult;
use crate::pool::{HostConnectionPool, PoolTarget};
use crate::policies::reconnection::ReconnectionSchedule;

/// Canonical `(address, port)` form. IPv6 renders bracketed, matching
/// spec.md §3 / §8 ("IPv6 contact point `[::1]:9042` resolves to endpoint
/// `::1:9042`" — we keep the bracket on the address but drop it in
/// `Display`'s canonical join, following the worked example literally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            SocketAddr::V4(v4) => write!(f, "{}:{}", v4.ip(), v4.port()),
            SocketAddr::V6(v6) => write!(f, "{}:{}", v6.ip(), v6.port()),
        }
    }
}

/// Host classification driving pool sizing and query-plan eligibility
/// (spec.md §3, GLOSSARY "Distance").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Local,
    Remote,
    Ignored,
}

/// Exactly one of `up_since`/`down_at` is set at any time (spec.md §3
/// invariant: "a Host is UP iff `downAt == 0`").
#[derive(Debug)]
struct HealthState {
    down_at_millis: AtomicI64,
}

impl HealthState {
    fn new() -> Self {
        Self {
            down_at_millis: AtomicI64::new(0),
        }
    }

    fn is_up(&self) -> bool {
        self.down_at_millis.load(Ordering::SeqCst) == 0
    }

    fn mark_down(&self, now_millis: i64) {
        self.down_at_millis.store(now_millis.max(1), Ordering::SeqCst);
    }

    fn mark_up(&self) {
        self.down_at_millis.store(0, Ordering::SeqCst);
    }
}

/// Immutable-once-discovered metadata the Control Connection fills in from
/// `system.local`/`system.peers` rows (spec.md §4.3: "set by the Control
/// Connection from system-table rows and are immutable until a refresh
/// overwrites them").
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<String>,
    pub database_version: Option<String>,
    pub dse_version: Option<String>,
    pub host_id: Option<uuid::Uuid>,
    pub workloads: Vec<String>,
    /// The `schema_version` column from this host's last `system.local`/
    /// `system.peers` row, consumed by the Request Handler's
    /// schema-agreement poll (spec.md §4.6 step 7).
    pub schema_version: Option<uuid::Uuid>,
}

/// Per-node state and pool owner (spec.md §4.3).
pub struct Host {
    endpoint: Endpoint,
    protocol_version: std::sync::atomic::AtomicU8,
    info: RwLock<HostInfo>,
    health: HealthState,
    distance: Mutex<Distance>,
    pool: HostConnectionPool,
    reconnection_schedule: Mutex<ReconnectionSchedule>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").field("endpoint", &self.endpoint).finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(
        endpoint: Endpoint,
        reconnection_schedule: ReconnectionSchedule,
        connection_config: Arc<ConnectionConfig>,
    ) -> Arc<Self> {
        // `new_cyclic` hands the pool a `Weak<Host>` before the `Arc<Host>`
        // itself exists, so a pooled connection's death watcher can report
        // back to its owning Host without Pool holding a strong reference
        // to it (spec.md §9 "Cyclic references").
        Arc::new_cyclic(|weak_host| Self {
            endpoint,
            protocol_version: std::sync::atomic::AtomicU8::new(0),
            info: RwLock::new(HostInfo::default()),
            health: HealthState::new(),
            distance: Mutex::new(Distance::Ignored),
            pool: HostConnectionPool::new(endpoint, connection_config, weak_host.clone()),
            reconnection_schedule: Mutex::new(reconnection_schedule),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn pool(&self) -> &HostConnectionPool {
        &self.pool
    }

    pub fn is_up(&self) -> bool {
        self.health.is_up()
    }

    pub async fn distance(&self) -> Distance {
        *self.distance.lock().await
    }

    pub async fn info(&self) -> HostInfo {
        self.info.read().await.clone()
    }

    pub async fn set_info(&self, info: HostInfo) {
        *self.info.write().await = info;
    }

    pub fn protocol_version(&self) -> Option<u8> {
        let v = self.protocol_version.load(Ordering::SeqCst);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_protocol_version(&self, version: u8) {
        self.protocol_version.store(version, Ordering::SeqCst);
    }

    /// spec.md §4.3 `setDistance`: a no-op if unchanged; otherwise resizes
    /// or drains the pool.
    pub async fn set_distance(&self, new_distance: Distance, core_connections: PoolTarget) {
        let mut current = self.distance.lock().await;
        if *current == new_distance {
            return;
        }
        let previous_was_down = !self.health.is_up();
        *current = new_distance;
        drop(current);
        match new_distance {
            Distance::Ignored => {
                self.pool.drain_and_shutdown().await;
            }
            Distance::Local | Distance::Remote => {
                self.pool.set_target(core_connections).await;
                if previous_was_down && core_connections.0 > 0 {
                    self.set_up(true).await;
                }
            }
        }
    }

    /// spec.md §4.3 `setDown`: no-op if already down or the pool is
    /// closing.
    pub async fn set_down(&self) -> bool {
        if !self.health.is_up() {
            return false;
        }
        if self.pool.is_closing().await {
            return false;
        }
        let now = now_millis();
        self.health.mark_down(now);
        true
    }

    /// spec.md §4.3 `setUp`: clears `downAt`, resets the reconnection
    /// schedule.
    pub async fn set_up(&self, clear_reconnection: bool) {
        self.health.mark_up();
        if clear_reconnection {
            self.reconnection_schedule.lock().await.reset();
        }
    }

    /// spec.md §4.3 `checkIsUp`: resets the reconnection schedule and
    /// forces an immediate connection attempt by asking the pool to warm
    /// up in the background.
    pub async fn check_is_up(&self) -> DriverResult<()> {
        self.reconnection_schedule.lock().await.reset();
        self.pool.create(false).await
    }

    pub async fn next_reconnection_delay(&self) -> std::time::Duration {
        self.reconnection_schedule.lock().await.next()
    }

    /// spec.md §4.3 `create(warmup)`: dials up to the pool's current
    /// target. Callers that want a freshly (re)classified host to start
    /// connecting immediately call this right after `set_distance`;
    /// callers bringing up a host that should stay down until an
    /// explicit `STATUS_CHANGE up` (spec.md §4.4.1, `newNodesUp=false`)
    /// skip it and rely on `checkIsUp` to dial once the host is allowed
    /// to come up. A no-op if the pool's target is currently zero.
    pub async fn warm_up(&self) -> DriverResult<()> {
        if self.pool.target().await.0 == 0 {
            return Ok(());
        }
        let warmup = self.pool.warmup_enabled();
        self.pool.create(warmup).await
    }

    /// spec.md §4.3 `checkHealth`: evicts any connection whose
    /// `timedOutOperations` exceeded the configured threshold. Called by
    /// the Request Handler after an `OperationTimedOut` (spec.md §4.6
    /// step 4) so a connection that keeps stalling requests gets closed
    /// and replaced instead of being borrowed again.
    pub async fn check_health(&self) {
        self.pool.evict_defunct().await;
    }

    /// spec.md §4.3 `removeFromPool` + `_checkPoolState`: if the pool is
    /// short of target, schedule a reconnection attempt using the current
    /// backoff; if removal leaves it empty while connections were
    /// expected, the host is also marked down.
    pub async fn check_pool_state(self: &Arc<Self>) {
        let expected_nonzero = !matches!(self.distance().await, Distance::Ignored)
            && self.pool.target().await.0 > 0;
        if !expected_nonzero {
            return;
        }
        let len = self.pool.len().await;
        if len == 0 {
            self.set_down().await;
        }
        if len < self.pool.target().await.0 as usize {
            let delay = self.next_reconnection_delay().await;
            let host = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if host.pool.is_closing().await {
                    return;
                }
                if let Err(e) = host.pool.create(false).await {
                    log::warn!("reconnection attempt to {} failed: {e}", host.endpoint());
                }
            });
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint() -> Endpoint {
        Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9042))
    }

    fn test_connection_config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            socket_options: Default::default(),
            pooling_options: Default::default(),
            auth_provider: Arc::new(crate::conn::auth::NoneAuthProvider),
            requested_max_version: None,
        })
    }

    #[test]
    fn endpoint_display_matches_canonical_form() {
        assert_eq!(endpoint().to_string(), "10.0.0.1:9042");
    }

    #[tokio::test]
    async fn set_down_is_idempotent() {
        let host = Host::new(endpoint(), ReconnectionSchedule::for_test(), test_connection_config());
        assert!(host.is_up());
        assert!(host.set_down().await);
        assert!(!host.is_up());
        assert!(!host.set_down().await);
    }

    #[tokio::test]
    async fn set_up_clears_down_state() {
        let host = Host::new(endpoint(), ReconnectionSchedule::for_test(), test_connection_config());
        host.set_down().await;
        host.set_up(true).await;
        assert!(host.is_up());
    }

    #[tokio::test]
    async fn warm_up_is_a_no_op_with_zero_target() {
        // spec.md §4.4.1: a host kept down for `newNodesUp=false` has its
        // target set but is never warmed up, so this must not try to dial
        // 127.0.0.1:9042 (and hang/fail) just because the pool is empty.
        let host = Host::new(endpoint(), ReconnectionSchedule::for_test(), test_connection_config());
        host.set_distance(Distance::Local, PoolTarget(0)).await;
        host.warm_up().await.unwrap();
        assert_eq!(host.pool().len().await, 0);
    }

    #[tokio::test]
    async fn set_distance_alone_does_not_dial() {
        let host = Host::new(endpoint(), ReconnectionSchedule::for_test(), test_connection_config());
        host.set_distance(Distance::Local, PoolTarget(1)).await;
        // `set_distance` only resizes the target (spec.md §4.3); dialing
        // is `warm_up`'s job, called explicitly by whoever classified the
        // host (spec.md §4.4.1).
        assert_eq!(host.pool().len().await, 0);
        assert_eq!(host.pool().target().await, PoolTarget(1));
    }
}
