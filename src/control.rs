//! The Control Connection: cluster-state oracle (spec.md §4.4).
//!
//! Resolves contact points, adopts one host's connection as a dedicated
//! metadata/event channel, refreshes the Host Map and [`Metadata`] from
//! `system.local`/`system.peers`, and re-establishes itself with backoff
//! whenever the adopted host or connection dies.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::ClientOptions;
use crate::conn::params::{parse_contact_point, ContactPoint};
use crate::conn::{Connection, ConnectionConfig};
use crate::error::{DriverError, DriverResult, NoHostAvailableError};
use crate::event_debouncer::EventDebouncer;
use crate::frame::{Event, EventKind, QueryResult, Request, Response, SchemaChangeResult};
use crate::host::{Distance, Endpoint, Host, HostInfo};
use crate::host_map::HostMap;
use crate::metadata::{KeyspaceMetadata, Metadata};
use crate::policies::reconnection::ReconnectionSchedule;
use crate::policies::Policies;
use crate::prepare::PrepareHandler;

/// A row from `system.local`, already materialized by the row/type codec
/// collaborator (spec.md §1 non-goal: this crate never decodes CQL row
/// bytes itself — see [`SystemRowsCodec`]).
#[derive(Debug, Clone, Default)]
pub struct SystemLocalRow {
    pub rpc_address: Option<IpAddr>,
    pub data_center: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<String>,
    pub release_version: Option<String>,
    pub host_id: Option<uuid::Uuid>,
    pub schema_version: Option<uuid::Uuid>,
}

/// A row from `system.peers` (spec.md §6 "Seed queries").
#[derive(Debug, Clone, Default)]
pub struct SystemPeerRow {
    pub peer: Option<IpAddr>,
    pub rpc_address: Option<IpAddr>,
    pub data_center: Option<String>,
    pub rack: Option<String>,
    pub tokens: Vec<String>,
    pub release_version: Option<String>,
    pub host_id: Option<uuid::Uuid>,
    pub dse_version: Option<String>,
    pub schema_version: Option<uuid::Uuid>,
}

/// Decodes the two seed-query result sets into rows (spec.md §1: "the
/// binary encoder/decoder for CQL types ... bytes-in/bytes-out interface
/// only"). A faithful deployment plugs in whatever row/type codec
/// implements the cluster's CQL type system; this crate only consumes the
/// materialized fields it needs for topology tracking.
pub trait SystemRowsCodec: Send + Sync + std::fmt::Debug {
    fn decode_local(&self, raw_metadata_and_rows: &[u8]) -> DriverResult<SystemLocalRow>;
    fn decode_peers(&self, raw_metadata_and_rows: &[u8]) -> DriverResult<Vec<SystemPeerRow>>;
}

struct Adopted {
    host: Arc<Host>,
    connection: Arc<Connection>,
}

/// spec.md §4.4: the cluster-state oracle. One instance per `Client`.
pub struct ControlConnection {
    hosts: Arc<HostMap>,
    metadata: Arc<Metadata>,
    policies: Policies,
    connection_config: Arc<ConnectionConfig>,
    prepare_handler: Arc<PrepareHandler>,
    row_codec: Arc<dyn SystemRowsCodec>,
    local_datacenter: Option<String>,
    default_port: u16,
    new_node_delay: Duration,
    new_nodes_up: bool,
    metadata_sync_enabled: bool,
    read_timeout: Duration,
    debouncer: Arc<EventDebouncer>,
    adopted: Mutex<Option<Adopted>>,
    reconnection_schedule: Mutex<ReconnectionSchedule>,
    /// Guards against the "down and ignore observed in the same tick"
    /// race called out in spec.md §9 Open Questions: whichever of the two
    /// one-shot listeners on the adopted host fires first wins, the other
    /// is suppressed.
    reconnect_guard: Mutex<()>,
    /// Set once by [`Self::shutdown`]; makes `refresh`/`trigger_reconnect`
    /// no-ops so a socket close racing the client's shutdown doesn't spin
    /// up a reconnect loop against a torn-down Host Map (spec.md §5
    /// "Client shutdown() aborts ... the Control Connection").
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection").finish_non_exhaustive()
    }
}

impl ControlConnection {
    /// spec.md §4.4 "Initialization": resolve contact points, seed the
    /// Host Map, and run the first `refresh(initializing=true)`.
    pub async fn init(
        options: &ClientOptions,
        hosts: Arc<HostMap>,
        metadata: Arc<Metadata>,
        connection_config: Arc<ConnectionConfig>,
        prepare_handler: Arc<PrepareHandler>,
        row_codec: Arc<dyn SystemRowsCodec>,
    ) -> DriverResult<Arc<Self>> {
        let control = Arc::new(Self {
            hosts: Arc::clone(&hosts),
            metadata,
            policies: options.policies.clone(),
            connection_config,
            prepare_handler,
            row_codec,
            local_datacenter: options.local_datacenter.clone(),
            default_port: options.protocol_options.port,
            new_node_delay: options.new_node_delay,
            new_nodes_up: options.new_nodes_up,
            metadata_sync_enabled: options.is_metadata_sync_enabled,
            read_timeout: options.socket_options.read_timeout,
            debouncer: EventDebouncer::new(options.refresh_schema_delay),
            adopted: Mutex::new(None),
            reconnection_schedule: Mutex::new(options.policies.reconnection.new_schedule()),
            reconnect_guard: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        });

        let resolved = resolve_contact_points(&options.contact_points, options.protocol_options.port).await?;
        for (original, endpoints) in &resolved {
            if endpoints.is_empty() {
                log::warn!("contact point {original} did not resolve to any address");
            }
            for endpoint in endpoints {
                control.add_contact_host(*endpoint).await;
            }
        }

        control.refresh(true).await?;
        spawn_debouncer_loop(Arc::clone(&control));
        Ok(control)
    }

    async fn add_contact_host(&self, endpoint: Endpoint) {
        if self.hosts.contains(endpoint).await {
            return;
        }
        let host = Host::new(
            endpoint,
            self.policies.reconnection.new_schedule(),
            Arc::clone(&self.connection_config),
        );
        // Contact points need an open pool before any metadata exists to
        // compute a real distance; treat them as local until the first
        // successful refresh assigns their real datacenter.
        host.set_distance(Distance::Local, crate::pool::PoolTarget(1)).await;
        if let Err(e) = host.warm_up().await {
            log::warn!("initial connection attempt to contact point {endpoint} failed: {e}");
        }
        self.hosts.upsert(host).await;
    }

    /// spec.md §4.4 `refresh(reuseQueryPlan)`.
    pub async fn refresh(self: &Arc<Self>, initializing: bool) -> DriverResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let plan = self.build_query_plan(initializing).await;
        let mut errors = NoHostAvailableError::new();

        for host in &plan {
            if !initializing {
                if !host.is_up() || matches!(host.distance().await, Distance::Ignored) {
                    continue;
                }
            }
            let connection = match host.pool().borrow_connection(None, None).await {
                Ok(c) => c,
                Err(e) => {
                    errors.push(host.endpoint(), e);
                    continue;
                }
            };

            match self.query_metadata(host, &connection).await {
                Ok(()) => {
                    self.adopt(Arc::clone(host), connection).await;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("control connection metadata query failed on {}: {e}", host.endpoint());
                    host.pool().remove(&connection).await;
                    errors.push(host.endpoint(), e);
                    continue;
                }
            }
        }

        if initializing {
            Err(DriverError::NoHostAvailable(errors))
        } else {
            let delay = self.reconnection_schedule.lock().await.next();
            log::warn!(
                "control connection could not find a host to adopt; retrying in {delay:?}"
            );
            let control = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = control.refresh(false).await {
                    log::warn!("scheduled control connection refresh failed: {e}");
                }
            });
            Ok(())
        }
    }

    async fn build_query_plan(&self, initializing: bool) -> Vec<Arc<Host>> {
        if initializing {
            return self.hosts.values().await;
        }
        let plan = self.policies.load_balancing.new_query_plan(&self.hosts).await;
        if plan.is_empty() {
            self.hosts.values().await
        } else {
            plan
        }
    }

    async fn query_metadata(&self, host: &Arc<Host>, connection: &Arc<Connection>) -> DriverResult<()> {
        let local_body = encode_select_query(
            "SELECT * FROM system.local WHERE key='local'",
            self.read_timeout,
        );
        let peers_body = encode_select_query(
            "SELECT peer, data_center, rack, tokens, rpc_address, host_id, dse_version, release_version, schema_version FROM system.peers",
            self.read_timeout,
        );

        let local_response = connection
            .send_stream(Request::Query { body: local_body }, self.read_timeout)
            .await?;
        let local_raw = rows_bytes(local_response)?;
        let local_row = self.row_codec.decode_local(&local_raw)?;

        let peers_response = connection
            .send_stream(Request::Query { body: peers_body }, self.read_timeout)
            .await?;
        let peers_raw = rows_bytes(peers_response)?;
        let peer_rows = self.row_codec.decode_peers(&peers_raw)?;

        self.apply_local_row(host, &local_row).await;
        self.apply_peer_rows(host, &peer_rows).await;

        let mut token_ring = HashMap::new();
        for token in &local_row.tokens {
            token_ring.insert(token.clone(), vec![host.endpoint().to_string()]);
        }
        self.metadata.rebuild_token_ring(token_ring).await;

        if self.metadata_sync_enabled {
            // A real deployment would enumerate `system_schema.keyspaces`
            // here; the core's job ends at invalidating/rebuilding the
            // cache shape (spec.md §4.4.2), row materialization for schema
            // tables is the same out-of-scope collaborator as above.
        }

        connection
            .send_stream(
                Request::Register {
                    event_types: vec!["TOPOLOGY_CHANGE", "STATUS_CHANGE", "SCHEMA_CHANGE"],
                },
                self.read_timeout,
            )
            .await?;

        Ok(())
    }

    async fn apply_local_row(&self, host: &Arc<Host>, row: &SystemLocalRow) {
        host.set_info(HostInfo {
            datacenter: row.data_center.clone(),
            rack: row.rack.clone(),
            tokens: row.tokens.clone(),
            database_version: row.release_version.clone(),
            dse_version: None,
            host_id: row.host_id,
            workloads: Vec::new(),
            schema_version: row.schema_version,
        })
        .await;
    }

    /// spec.md §4.4.1 "Peer-row processing".
    async fn apply_peer_rows(&self, local_host: &Arc<Host>, rows: &[SystemPeerRow]) {
        let mut seen = vec![local_host.endpoint()];

        for row in rows {
            let addr = match row.rpc_address {
                Some(addr) if !addr.is_unspecified() => addr,
                Some(_) => match row.peer {
                    Some(peer) => peer,
                    None => {
                        log::warn!("peer row has rpc_address 0.0.0.0 and no peer column; dropping");
                        continue;
                    }
                },
                None => {
                    log::warn!("peer row missing rpc_address; dropping");
                    continue;
                }
            };

            let socket_addr = SocketAddr::new(addr, self.default_port);
            let translated = self
                .policies
                .address_translator
                .translate(socket_addr)
                .await
                .unwrap_or(socket_addr);
            let endpoint = Endpoint::new(translated);
            seen.push(endpoint);

            let (host, is_new) = match self.hosts.get(endpoint).await {
                Some(h) => (h, false),
                None => {
                    let h = Host::new(
                        endpoint,
                        self.policies.reconnection.new_schedule(),
                        Arc::clone(&self.connection_config),
                    );
                    self.hosts.upsert(Arc::clone(&h)).await;
                    (h, true)
                }
            };

            host.set_info(HostInfo {
                datacenter: row.data_center.clone(),
                rack: row.rack.clone(),
                tokens: row.tokens.clone(),
                database_version: row.release_version.clone(),
                dse_version: row.dse_version.clone(),
                host_id: row.host_id,
                workloads: Vec::new(),
                schema_version: row.schema_version,
            })
            .await;

            let distance = self
                .policies
                .load_balancing
                .distance(&host.info().await, self.local_datacenter.as_deref());
            let target = core_connections_for(&self.connection_config, distance);
            host.set_distance(distance, target).await;

            if is_new && !self.new_nodes_up {
                // Freshly discovered and newNodesUp=false: stays down
                // until an explicit STATUS_CHANGE up event (spec.md
                // §4.4.1); `checkIsUp` dials then, so skip warming up now.
                host.set_down().await;
            } else if let Err(e) = host.warm_up().await {
                log::warn!("connection attempt to {endpoint} failed while applying distance: {e}");
            }
        }

        // Reconcile: decommission any host neither in the new peers nor
        // the local host (spec.md §4.4.1 "Reconcile").
        for existing in self.hosts.values().await {
            if !seen.contains(&existing.endpoint()) {
                self.hosts.remove(existing.endpoint()).await;
                existing.pool().drain_and_shutdown().await;
            }
        }

        self.validate_local_datacenter().await;
    }

    /// spec.md §6 `localDataCenter`: "if set, validated against discovered
    /// hosts". Run once per `refresh()` so a `localDataCenter` that never
    /// matches any discovered host's datacenter surfaces as a warning
    /// rather than silently degrading to whatever the load-balancing
    /// policy's distance fallback does with an unmatched name.
    async fn validate_local_datacenter(&self) {
        let Some(configured) = &self.local_datacenter else {
            return;
        };
        let mut seen_any = false;
        for host in self.hosts.values().await {
            if host.info().await.datacenter.as_deref() == Some(configured.as_str()) {
                seen_any = true;
                break;
            }
        }
        if !seen_any {
            log::warn!(
                "local_datacenter {configured:?} does not match any discovered host's datacenter"
            );
        }
    }

    /// Adopts `connection` as the metadata/event channel and installs the
    /// one-shot `socketClose` listener (spec.md §4.4 "On success": "install
    /// two one-shot listeners on the adopted host and connection:
    /// `down|ignore` and `socketClose`. Either listener triggers
    /// reconnection"). The `down|ignore` half is the existing
    /// `STATUS_CHANGE down` / distance-change path, which already funnels
    /// into `trigger_reconnect` via the guard below; both share the same
    /// one-shot suppression (spec.md §9 Open Questions).
    async fn adopt(self: &Arc<Self>, host: Arc<Host>, connection: Arc<Connection>) {
        self.reconnection_schedule.lock().await.reset();
        let events = connection.subscribe_events();
        *self.adopted.lock().await = Some(Adopted {
            host,
            connection: Arc::clone(&connection),
        });
        spawn_event_pump(Arc::clone(self), connection, events);
    }

    async fn trigger_reconnect(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let _guard = match self.reconnect_guard.try_lock() {
            Ok(g) => g,
            Err(_) => return, // another trigger already in flight
        };
        if let Err(e) = self.refresh(false).await {
            log::warn!("control connection reconnect failed: {e}");
        }
    }

    /// spec.md §5 "Client shutdown() aborts all Pools and the Control
    /// Connection; pending operations fail with a shutdown error; emitted
    /// once; idempotent". Stops the debouncer's `run` loop and closes the
    /// adopted connection so its event pump exits instead of scheduling a
    /// reconnect.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.debouncer.shutdown();
        if let Some(adopted) = self.adopted.lock().await.take() {
            adopted.connection.close().await;
        }
    }

    /// spec.md §4.4.2 "Event handling". Called by whatever task is reading
    /// events off the adopted connection's event channel.
    pub async fn handle_event(self: &Arc<Self>, event: Event) {
        match event.kind() {
            EventKind::TopologyChange => {
                let control = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    if let Err(e) = control.refresh(false).await {
                        log::warn!("topology-change refresh failed: {e}");
                    }
                });
            }
            EventKind::StatusChange => {
                if let Event::StatusChange { change, addr } = event {
                    self.handle_status_change(&change, addr).await;
                }
            }
            EventKind::SchemaChange => {
                if let Event::SchemaChange(change) = event {
                    let process_now = change.change_type == "DROPPED";
                    self.debouncer.queue(change, process_now).await;
                }
            }
        }
    }

    async fn handle_status_change(&self, change: &str, addr: SocketAddr) {
        let translated = self.policies.address_translator.translate(addr).await.unwrap_or(addr);
        let endpoint = Endpoint::new(translated);
        let Some(host) = self.hosts.get(endpoint).await else {
            return;
        };
        match change {
            "UP" => {
                if matches!(host.distance().await, Distance::Ignored) {
                    host.set_up(true).await;
                } else {
                    let delay = self.new_node_delay;
                    let prepare_handler = Arc::clone(&self.prepare_handler);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if host.check_is_up().await.is_ok() {
                            // spec.md §4.7 `prepareAllQueries` / §4.3
                            // "Re-prepare on up": a host that was down
                            // lost whatever server-side PREPARE state it
                            // had, so every cached statement needs
                            // re-issuing before it's a safe EXECUTE target.
                            prepare_handler.prepare_all_queries(&host).await;
                        }
                    });
                }
            }
            "DOWN" => {
                if !matches!(host.distance().await, Distance::Ignored) {
                    log::warn!("received STATUS_CHANGE down for {endpoint}; reconnection machinery owns the transition");
                }
            }
            other => log::warn!("unrecognized STATUS_CHANGE kind {other}"),
        }
    }

    /// Applies one coalesced batch of schema events to [`Metadata`]
    /// (spec.md §4.4.2 "SCHEMA_CHANGE": routed through the debouncer,
    /// keyspace drops purge directly, everything else invalidates or
    /// targeted-refreshes).
    pub async fn apply_schema_batch(&self, batch: Vec<SchemaChangeResult>) {
        for change in batch {
            match change.target.as_str() {
                "KEYSPACE" if change.change_type == "DROPPED" => {
                    self.metadata.drop_keyspace(&change.keyspace).await;
                }
                "KEYSPACE" => {
                    self.metadata
                        .set_keyspace(change.keyspace.clone(), KeyspaceMetadata::default())
                        .await;
                }
                target => {
                    if let Some(name) = &change.object_name {
                        self.metadata.invalidate_object(&change.keyspace, target, name).await;
                    }
                }
            }
        }
    }

    pub fn prepare_handler(&self) -> &Arc<PrepareHandler> {
        &self.prepare_handler
    }
}

/// Forwards events off the adopted connection's broadcast subscription into
/// [`ControlConnection::handle_event`], and treats the subscription closing
/// (every sender side gone, i.e. the connection was dropped) as the
/// `socketClose` listener from spec.md §4.4 "On success".
fn spawn_event_pump(
    control: Arc<ControlConnection>,
    connection: Arc<Connection>,
    mut events: tokio::sync::broadcast::Receiver<Event>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = connection.closed() => {
                    log::debug!(
                        "adopted control connection to {} closed; reconnecting",
                        connection.endpoint()
                    );
                    control.trigger_reconnect().await;
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => control.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("control connection event subscription lagged by {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

fn spawn_debouncer_loop(control: Arc<ControlConnection>) {
    let debouncer = Arc::clone(&control.debouncer);
    tokio::spawn(async move {
        debouncer
            .run(move |batch| {
                let control = Arc::clone(&control);
                tokio::spawn(async move {
                    control.apply_schema_batch(batch).await;
                });
            })
            .await;
    });
}

fn core_connections_for(config: &ConnectionConfig, distance: Distance) -> crate::pool::PoolTarget {
    use crate::pool::PoolTarget;
    let per_host = config.pooling_options.core_connections_per_host;
    PoolTarget(match distance {
        Distance::Local => per_host.local,
        Distance::Remote => per_host.remote,
        Distance::Ignored => per_host.ignored,
    })
}

fn rows_bytes(response: Response) -> DriverResult<Vec<u8>> {
    match response {
        Response::Result(QueryResult::Rows { raw_metadata_and_rows, .. }) => Ok(raw_metadata_and_rows),
        Response::Error(e) => Err(DriverError::Response(e)),
        other => Err(crate::error::internal_err!(
            "expected a Rows result from a metadata query, got {other:?}"
        )),
    }
}

/// Encodes a parameterless `QUERY` request body at `LOCAL_ONE` (spec.md §6
/// "Seed queries"): the row/type codec collaborator is not needed here
/// since these queries carry no bound values.
fn encode_select_query(cql: &str, _read_timeout: Duration) -> Vec<u8> {
    use byteorder::{BigEndian, WriteBytesExt};
    let mut body = Vec::new();
    body.write_u32::<BigEndian>(cql.len() as u32).unwrap();
    body.extend_from_slice(cql.as_bytes());
    body.write_u16::<BigEndian>(crate::config::LOCAL_ONE).unwrap();
    body.push(0x00);
    body
}

/// spec.md §4.4 "Initialization" step 1 + §8 boundary behaviors: resolves
/// every contact point, recording `originalName -> [resolved endpoints]`
/// for diagnostics. Hostnames resolve to every address the OS resolver
/// returns (spec.md: "falling back to the OS resolver if neither family
/// yielded an address" — `lookup_host` already queries both families).
async fn resolve_contact_points(
    contact_points: &[String],
    default_port: u16,
) -> DriverResult<Vec<(String, Vec<Endpoint>)>> {
    let mut out = Vec::with_capacity(contact_points.len());
    for raw in contact_points {
        let parsed = parse_contact_point(raw)?;
        let endpoints = match parsed {
            ContactPoint::Resolved(addr) => vec![Endpoint::new(addr)],
            ContactPoint::Hostname { host, port } => {
                let port = port.unwrap_or(default_port);
                match tokio::net::lookup_host((host.as_str(), port)).await {
                    Ok(addrs) => {
                        let mut unique: Vec<SocketAddr> = addrs.collect();
                        unique.sort();
                        unique.dedup();
                        unique.into_iter().map(Endpoint::new).collect()
                    }
                    Err(e) => {
                        log::warn!("failed to resolve contact point {host}: {e}");
                        Vec::new()
                    }
                }
            }
        };
        out.push((raw.clone(), endpoints));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_a_bare_ip_without_dns() {
        let resolved = resolve_contact_points(&["10.0.0.1:9042".to_string()], 9042)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1.len(), 1);
    }

    #[tokio::test]
    async fn resolves_bracketed_ipv6_without_dns() {
        let resolved = resolve_contact_points(&["[::1]:9042".to_string()], 9042)
            .await
            .unwrap();
        assert_eq!(resolved[0].1[0].to_string(), "::1:9042");
    }
}
