//! Host Connection Pool (spec.md §3 "Pool", §4.3).
//!
//! Connections are held in a copy-on-write array, mirroring
//! [`crate::host_map::HostMap`]'s snapshot discipline: readers picking a
//! connection to borrow never block on a writer resizing the pool, since
//! they always see a whole, consistent `Arc<Vec<_>>` snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::conn::socket::connect_plain_tcp;
use crate::conn::{Connection, ConnectionConfig};
use crate::error::{DriverError, DriverResult};
use crate::host::{Endpoint, Host};

/// Desired connection count for a host at its current [`crate::host::Distance`]
/// (spec.md §6 `pooling.coreConnectionsPerHost`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolTarget(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Initial,
    Closing,
    ShuttingDown,
    ShutDown,
}

/// A fixed-size (at any instant) set of [`Connection`]s to one host
/// (spec.md §4.3 "Pool"). `create`/`remove` install a new snapshot rather
/// than mutating in place.
pub struct HostConnectionPool {
    endpoint: Endpoint,
    config: Arc<ConnectionConfig>,
    /// Weak per spec.md §9 "Cyclic references (Host<->Pool<->Connection<->Host)":
    /// Host exclusively owns Pool, so Pool's reference back to its owning
    /// Host (used only to report a connection's death) must not be strong.
    host: Weak<Host>,
    connections: Mutex<Arc<Vec<Arc<Connection>>>>,
    target: Mutex<PoolTarget>,
    state: Mutex<PoolState>,
    cursor: AtomicUsize,
    creating: tokio::sync::Semaphore,
}

impl HostConnectionPool {
    pub fn new(endpoint: Endpoint, config: Arc<ConnectionConfig>, host: Weak<Host>) -> Self {
        Self {
            endpoint,
            config,
            host,
            connections: Mutex::new(Arc::new(Vec::new())),
            target: Mutex::new(PoolTarget(0)),
            state: Mutex::new(PoolState::Initial),
            cursor: AtomicUsize::new(0),
            creating: tokio::sync::Semaphore::new(1),
        }
    }

    pub async fn target(&self) -> PoolTarget {
        *self.target.lock().await
    }

    /// spec.md §6 `pooling.warmup`: whether `Host::set_distance` should
    /// block for every core connection or just the first.
    pub fn warmup_enabled(&self) -> bool {
        self.config.pooling_options.warmup
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_closing(&self) -> bool {
        !matches!(*self.state.lock().await, PoolState::Initial)
    }

    /// spec.md §4.3: resizing the target does not itself dial or drop
    /// connections; the next `create` call (driven by the Control
    /// Connection's periodic health sweep) converges toward it.
    pub async fn set_target(&self, target: PoolTarget) {
        *self.target.lock().await = target;
    }

    /// Opens connections one at a time, single-flight, until the pool's
    /// snapshot has at least `target` entries (spec.md §4.3 `create`).
    /// With `warmup = false`, opens at most one connection even if the
    /// target is higher, matching `checkIsUp`'s "get back on the query
    /// plan quickly, let the background sweep finish warming up" intent.
    pub async fn create(&self, warmup: bool) -> DriverResult<()> {
        let _permit = self
            .creating
            .acquire()
            .await
            .expect("pool semaphore is never closed");

        if self.is_closing().await {
            return Ok(());
        }

        let target = self.target().await.0 as usize;
        let mut errors = Vec::new();
        loop {
            let current_len = self.connections.lock().await.len();
            if current_len >= target || (!warmup && current_len >= 1) {
                break;
            }
            match self.open_one().await {
                Ok(conn) => {
                    let mut guard = self.connections.lock().await;
                    let mut next = (**guard).clone();
                    next.push(conn);
                    *guard = Arc::new(next);
                }
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }

        if self.connections.lock().await.is_empty() {
            if let Some(e) = errors.into_iter().next() {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn open_one(&self) -> DriverResult<Arc<Connection>> {
        let socket = connect_plain_tcp(
            self.endpoint.socket_addr(),
            self.config.socket_options.connect_timeout,
            self.config.socket_options.tcp_no_delay,
        )
        .await?;
        // spec.md §3 Host "protocol version (shared with pool)": once one
        // connection to this host has settled on a version, every later
        // connection proposes that version directly instead of
        // re-running the downgrade-on-PROTOCOL_ERROR probe each time.
        let host = self.host.upgrade();
        let requested_max_version = host
            .as_ref()
            .and_then(|h| h.protocol_version())
            .or(self.config.requested_max_version);
        let conn = Connection::open(
            self.endpoint,
            Box::new(socket),
            &self.config.socket_options,
            &self.config.pooling_options,
            Arc::clone(&self.config.auth_provider),
            requested_max_version,
        )
        .await?;
        if let Some(host) = host {
            if host.protocol_version().is_none() {
                host.set_protocol_version(conn.protocol_version().raw());
            }
        }
        // Topology/status/schema events are only acted on by the Control
        // Connection, which subscribes for itself once it adopts a
        // connection (spec.md §4.1 "Event subscription"); an ordinary pool
        // connection has no subscriber, and a broadcast send with none is
        // a harmless no-op, so there is nothing to drain here.
        self.spawn_death_watcher(Arc::clone(&conn));
        Ok(conn)
    }

    /// Notices an ordinary pooled connection closing (write error, read
    /// timeout past `defunctReadTimeoutThreshold`, idle heartbeat failure)
    /// and folds it back into `removeFromPool`/`_checkPoolState` (spec.md
    /// §4.3), the same invariant the Control Connection's adopted
    /// connection gets via its own dedicated event pump.
    fn spawn_death_watcher(&self, conn: Arc<Connection>) {
        let host = self.host.clone();
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(host) = host.upgrade() {
                host.pool().remove(&conn).await;
                host.check_pool_state().await;
            }
        });
    }

    /// Borrows the least-loaded of two randomly sampled connections
    /// (spec.md §4.3 `borrowConnection`: "power of two choices"), avoiding
    /// the connection used for the previous attempt of the same request
    /// where possible. When `keyspace` names a keyspace the chosen
    /// connection isn't already sitting in, issues `changeKeyspace` on it
    /// first (spec.md §4.3 `borrowConnection`: "if the selected
    /// connection's current keyspace differs from the requested one,
    /// issue `changeKeyspace` first").
    pub async fn borrow_connection(
        &self,
        keyspace: Option<&str>,
        avoid: Option<&Arc<Connection>>,
    ) -> DriverResult<Arc<Connection>> {
        let snapshot = Arc::clone(&*self.connections.lock().await);
        if snapshot.is_empty() {
            return Err(DriverError::NoHostAvailable(
                crate::error::NoHostAvailableError::new(),
            ));
        }

        let chosen = if snapshot.len() == 1 {
            Arc::clone(&snapshot[0])
        } else {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
            let a = &snapshot[start];
            let b = &snapshot[(start + 1) % snapshot.len()];
            let candidates: [&Arc<Connection>; 2] = [a, b];
            let picked = candidates
                .into_iter()
                .filter(|c| avoid.map(|prev| !Arc::ptr_eq(prev, c)).unwrap_or(true))
                .min_by_key(|c| c.in_flight())
                .unwrap_or(a);
            Arc::clone(picked)
        };

        if let Some(requested) = keyspace {
            if chosen.keyspace().await.as_deref() != Some(requested) {
                chosen.change_keyspace(requested, self.config.socket_options.read_timeout).await?;
            }
        }
        Ok(chosen)
    }

    /// Drops a connection from the snapshot, e.g. after the reader task
    /// observes the socket close (spec.md §4.3 `remove`).
    pub async fn remove(&self, dead: &Arc<Connection>) {
        let mut guard = self.connections.lock().await;
        let next: Vec<_> = guard.iter().filter(|c| !Arc::ptr_eq(c, dead)).cloned().collect();
        *guard = Arc::new(next);
    }

    /// Closes every timed-out connection past the defunct threshold
    /// (spec.md §4.3 `checkHealth`).
    pub async fn evict_defunct(&self) {
        let threshold = self.config.socket_options.defunct_read_timeout_threshold;
        let dead: Vec<_> = {
            let guard = self.connections.lock().await;
            guard
                .iter()
                .filter(|c| c.timed_out_operations() >= threshold)
                .cloned()
                .collect()
        };
        for conn in dead {
            conn.close().await;
            self.remove(&conn).await;
        }
    }

    /// spec.md §4.3 `drainAndShutdown`: stop accepting new work, let
    /// in-flight requests finish up to a hard cutoff, then close
    /// everything regardless.
    pub async fn drain_and_shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if *state != PoolState::Initial {
                return;
            }
            *state = PoolState::Closing;
        }
        let hard_cutoff = self.config.socket_options.read_timeout + Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + hard_cutoff;
        loop {
            let still_busy = self
                .connections
                .lock()
                .await
                .iter()
                .any(|c| c.in_flight() > 0);
            if !still_busy || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.shutdown().await;
    }

    /// Closes every connection immediately, without waiting for in-flight
    /// requests to drain.
    pub async fn shutdown(&self) {
        *self.state.lock().await = PoolState::ShuttingDown;
        let mut guard = self.connections.lock().await;
        for conn in guard.iter() {
            conn.close().await;
        }
        *guard = Arc::new(Vec::new());
        *self.state.lock().await = PoolState::ShutDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::auth::NoneAuthProvider;
    use crate::config::{PoolingOptions, SocketOptions};
    use crate::frame::{FrameFlags, FrameHeader, ResponseOpcode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts `count` connections and answers every STARTUP with READY,
    /// then idles (spec.md §8 scenario 2 "Borrow fallover" needs live,
    /// idle connections to borrow against).
    async fn spawn_ready_server(count: usize) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..count {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut header_buf = [0u8; crate::frame::HEADER_LEN];
                    if sock.read_exact(&mut header_buf).await.is_err() {
                        return;
                    }
                    let header = FrameHeader::read_from(&header_buf[..]).unwrap();
                    let mut body = vec![0u8; header.body_len as usize];
                    let _ = sock.read_exact(&mut body).await;

                    let reply_header = FrameHeader {
                        version: header.version,
                        response: true,
                        flags: FrameFlags::empty(),
                        stream_id: header.stream_id,
                        opcode: ResponseOpcode::Ready as u8,
                        body_len: 0,
                    };
                    let mut reply = Vec::new();
                    reply_header.write_to(&mut reply).unwrap();
                    let _ = sock.write_all(&reply).await;
                    let _ = sock.flush().await;
                    // Idle afterward; stay connected so borrow_connection
                    // has live, healthy candidates to choose between.
                    let mut sink = [0u8; 64];
                    loop {
                        if sock.read(&mut sink).await.unwrap_or(0) == 0 {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            socket_options: SocketOptions::default(),
            pooling_options: PoolingOptions::default(),
            auth_provider: Arc::new(NoneAuthProvider),
            requested_max_version: None,
        })
    }

    #[tokio::test]
    async fn create_warms_up_to_target_and_borrow_round_robins() {
        let addr = spawn_ready_server(2).await;
        let pool = HostConnectionPool::new(Endpoint::new(addr), test_config(), Weak::new());
        pool.set_target(PoolTarget(2)).await;
        pool.create(true).await.unwrap();
        assert_eq!(pool.len().await, 2);

        // spec.md §8 scenario 2: with both connections idle (in-flight 0),
        // alternating the rotating cursor must alternate which connection
        // is returned rather than sticking to one.
        let first = pool.borrow_connection(None, None).await.unwrap();
        let second = pool.borrow_connection(None, Some(&first)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn empty_pool_fails_borrow_with_no_host_available() {
        let pool = HostConnectionPool::new(
            Endpoint::new("127.0.0.1:1".parse().unwrap()),
            test_config(),
            Weak::new(),
        );
        let err = pool.borrow_connection(None, None).await.unwrap_err();
        assert!(matches!(err, DriverError::NoHostAvailable(_)));
    }

    #[tokio::test]
    async fn remove_drops_from_snapshot_without_mutating_in_place() {
        let addr = spawn_ready_server(1).await;
        let pool = HostConnectionPool::new(Endpoint::new(addr), test_config(), Weak::new());
        pool.set_target(PoolTarget(1)).await;
        pool.create(true).await.unwrap();
        let conn = pool.borrow_connection(None, None).await.unwrap();
        pool.remove(&conn).await;
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn evict_defunct_closes_connections_past_the_threshold() {
        // spec.md §4.3 `checkHealth`: `spawn_ready_server` answers STARTUP
        // then idles, so a query sent afterward times out without the
        // server ever replying — the same shape a stalled node produces.
        let addr = spawn_ready_server(1).await;
        let mut socket_options = SocketOptions::default();
        socket_options.defunct_read_timeout_threshold = 1;
        let config = Arc::new(ConnectionConfig {
            socket_options,
            pooling_options: PoolingOptions::default(),
            auth_provider: Arc::new(NoneAuthProvider),
            requested_max_version: None,
        });
        let pool = HostConnectionPool::new(Endpoint::new(addr), config, Weak::new());
        pool.set_target(PoolTarget(1)).await;
        pool.create(true).await.unwrap();
        let conn = pool.borrow_connection(None, None).await.unwrap();

        let timed_out = conn
            .send_stream(crate::frame::Request::Query { body: vec![] }, Duration::from_millis(20))
            .await;
        assert!(matches!(timed_out, Err(DriverError::OperationTimedOut(_))));
        assert_eq!(conn.timed_out_operations(), 1);

        pool.evict_defunct().await;
        assert_eq!(pool.len().await, 0);
    }

    /// Answers STARTUP with READY and every frame after that with a Void
    /// `RESULT` — enough for `USE <keyspace>` (spec.md §4.1 `changeKeyspace`
    /// sends a `QUERY` and expects a `RESULT` back) without a full query
    /// executor on the other end.
    async fn spawn_use_aware_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                loop {
                    let mut header_buf = [0u8; crate::frame::HEADER_LEN];
                    if sock.read_exact(&mut header_buf).await.is_err() {
                        return;
                    }
                    let header = FrameHeader::read_from(&header_buf[..]).unwrap();
                    let mut body = vec![0u8; header.body_len as usize];
                    let _ = sock.read_exact(&mut body).await;

                    let is_startup = header.opcode == crate::frame::RequestOpcode::Startup as u8;
                    let (opcode, reply_body): (u8, Vec<u8>) = if is_startup {
                        (ResponseOpcode::Ready as u8, Vec::new())
                    } else {
                        (ResponseOpcode::Result as u8, vec![0, 0, 0, 1])
                    };
                    let reply_header = FrameHeader {
                        version: header.version,
                        response: true,
                        flags: FrameFlags::empty(),
                        stream_id: header.stream_id,
                        opcode,
                        body_len: reply_body.len() as u32,
                    };
                    let mut reply = Vec::new();
                    reply_header.write_to(&mut reply).unwrap();
                    reply.extend_from_slice(&reply_body);
                    if sock.write_all(&reply).await.is_err() || sock.flush().await.is_err() {
                        return;
                    }
                }
            });
        });
        addr
    }

    #[tokio::test]
    async fn borrow_connection_switches_keyspace_when_it_differs() {
        let addr = spawn_use_aware_server().await;
        let pool = HostConnectionPool::new(Endpoint::new(addr), test_config(), Weak::new());
        pool.set_target(PoolTarget(1)).await;
        pool.create(true).await.unwrap();

        let conn = pool.borrow_connection(Some("ks1"), None).await.unwrap();
        assert_eq!(conn.keyspace().await.as_deref(), Some("ks1"));

        // Same connection, no keyspace requested: no `USE` needed, state
        // unchanged.
        let conn = pool.borrow_connection(None, None).await.unwrap();
        assert_eq!(conn.keyspace().await.as_deref(), Some("ks1"));

        let conn = pool.borrow_connection(Some("ks2"), None).await.unwrap();
        assert_eq!(conn.keyspace().await.as_deref(), Some("ks2"));
    }
}
