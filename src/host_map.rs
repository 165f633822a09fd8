//! Copy-on-write associative container of Hosts keyed by endpoint
//! (spec.md §3 "Host Map", §8 "Host Map `values()` called twice with no
//! intervening mutation returns the same object").
//!
//! Mirrors the teacher's pattern of swapping an `Arc` snapshot instead of
//! locking for reads (see `conn/am_conn_core.rs`'s `Arc<Mutex<..>>`
//! ownership discipline, generalized here to a reader/writer split since
//! the map itself must support lock-free, reference-stable iteration).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::host::{Endpoint, Host};

/// Emitted whenever the map's membership changes.
#[derive(Debug, Clone)]
pub enum HostMapEvent {
    Add(Arc<Host>),
    Remove(Endpoint),
}

type Snapshot = Arc<HashMap<Endpoint, Arc<Host>>>;

pub struct HostMap {
    snapshot: RwLock<Snapshot>,
    subscribers: Mutex<Vec<tokio::sync::mpsc::UnboundedSender<HostMapEvent>>>,
}

impl std::fmt::Debug for HostMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMap").finish_non_exhaustive()
    }
}

impl Default for HostMap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMap {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the live snapshot `Arc`. Two calls with no intervening
    /// mutation are guaranteed to return the same `Arc` pointer (spec.md §8).
    pub async fn snapshot(&self) -> Snapshot {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Iteration helper: values of the current snapshot as a `Vec`.
    pub async fn values(&self) -> Vec<Arc<Host>> {
        self.snapshot().await.values().cloned().collect()
    }

    pub async fn get(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        self.snapshot().await.get(&endpoint).cloned()
    }

    pub async fn contains(&self, endpoint: Endpoint) -> bool {
        self.snapshot().await.contains_key(&endpoint)
    }

    pub async fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<HostMapEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    async fn emit(&self, event: HostMapEvent) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Inserts or replaces a Host, allocating a new backing map and
    /// atomically swapping the pointer (spec.md §3, §9 "Copy-on-write Host
    /// Map"). Returns the host that is now current for this endpoint.
    pub async fn upsert(&self, host: Arc<Host>) {
        let endpoint = host.endpoint();
        let is_new = {
            let mut guard = self.snapshot.write().await;
            let is_new = !guard.contains_key(&endpoint);
            let mut next = (**guard).clone();
            next.insert(endpoint, Arc::clone(&host));
            *guard = Arc::new(next);
            is_new
        };
        if is_new {
            self.emit(HostMapEvent::Add(host)).await;
        }
    }

    /// Removes a Host from the map, allocating a new backing map (spec.md
    /// §4.4.1 "Reconcile").
    pub async fn remove(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        let removed = {
            let mut guard = self.snapshot.write().await;
            if !guard.contains_key(&endpoint) {
                return None;
            }
            let mut next = (**guard).clone();
            let removed = next.remove(&endpoint);
            *guard = Arc::new(next);
            removed
        };
        if removed.is_some() {
            self.emit(HostMapEvent::Remove(endpoint)).await;
        }
        removed
    }

    /// Full reinitialization (spec.md §5 "the Host Map is mutated only by
    /// the Control Connection (and `reset()` on full reinitialization)").
    pub async fn reset(&self) {
        *self.snapshot.write().await = Arc::new(HashMap::new());
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::auth::NoneAuthProvider;
    use crate::conn::ConnectionConfig;
    use crate::policies::reconnection::ReconnectionSchedule;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn endpoint(last_octet: u8) -> Endpoint {
        Endpoint::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            9042,
        ))
    }

    fn test_connection_config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            socket_options: Default::default(),
            pooling_options: Default::default(),
            auth_provider: Arc::new(NoneAuthProvider),
            requested_max_version: None,
        })
    }

    fn test_host(last_octet: u8) -> Arc<Host> {
        Host::new(
            endpoint(last_octet),
            ReconnectionSchedule::for_test(),
            test_connection_config(),
        )
    }

    #[tokio::test]
    async fn snapshot_is_reference_stable_across_reads() {
        let map = HostMap::new();
        map.upsert(test_host(1)).await;
        let a = map.snapshot().await;
        let b = map.snapshot().await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn mutation_allocates_a_new_snapshot() {
        let map = HostMap::new();
        map.upsert(test_host(1)).await;
        let a = map.snapshot().await;
        map.upsert(test_host(2)).await;
        let b = map.snapshot().await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    async fn remove_reconciles_membership() {
        let map = HostMap::new();
        map.upsert(test_host(1)).await;
        assert!(map.contains(endpoint(1)).await);
        map.remove(endpoint(1)).await;
        assert!(!map.contains(endpoint(1)).await);
    }
}
