//! The Request Handler: per-logical-request state machine (spec.md §4.6).
//!
//! Pulls a query plan from the load-balancing policy, borrows a connection
//! per host, dispatches the frame, and on error consults the retry policy;
//! an idempotent request may additionally race a speculative copy against
//! a later host in the same plan. Exactly one terminal outcome is ever
//! delivered to the caller (spec.md §8: "A request followed by
//! `shutdown()` never fires its success callback after `shutdown` has
//! returned").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::conn::{Connection, PreparedInfo};
use crate::error::{DriverError, DriverResult, NoHostAvailableError};
use crate::frame::{QueryResult, Request, Response, ResponseErrorKind};
use crate::host::{Distance, Endpoint, Host};
use crate::host_map::HostMap;
use crate::policies::retry::{ConsistencyLevel, RetryDecision};
use crate::policies::Policies;
use crate::prepare::PrepareHandler;

/// What to send once a connection is in hand (spec.md §3 "Request"): a
/// plain query, or an execute against an already-prepared statement
/// identified by `info`. Parameter encoding is the caller's job (spec.md
/// §1 non-goal) — `body` arrives pre-encoded, consistency/flags and all.
#[derive(Clone)]
pub enum RequestKind {
    Simple { body: Vec<u8> },
    Prepared {
        query: String,
        keyspace: Option<String>,
        info: PreparedInfo,
        body: Vec<u8>,
    },
    /// A `BATCH` request (spec.md §6 opcodes, §4 item 12 "Client facade":
    /// `batch`). Re-preparation on `UNPREPARED` is not attempted here: the
    /// server's error only names one offending statement id inside a
    /// batch that may mix prepared and simple statements, and picking it
    /// back out requires the row/type codec collaborator this crate does
    /// not have (spec.md §1 non-goal) — an `UNPREPARED` batch error falls
    /// through to the ordinary request-error retry policy instead.
    Batch { body: Vec<u8> },
}

/// Resolved per-request execution options (spec.md §3 "Execution
/// Profile", §6 `queryOptions`).
#[derive(Clone)]
pub struct ExecutionOptions {
    pub consistency: ConsistencyLevel,
    pub read_timeout: Duration,
    pub is_idempotent: bool,
}

#[derive(Clone)]
pub struct RequestSpec {
    pub kind: RequestKind,
    pub options: ExecutionOptions,
}

/// Diagnostic envelope returned alongside a successful result (spec.md
/// §4.6 step 7: "`info` carries the queried host, speculative count,
/// achieved consistency, and schema-agreement flag").
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub host: Endpoint,
    pub speculative_execution_count: u32,
    pub achieved_consistency: ConsistencyLevel,
    pub is_schema_in_agreement: bool,
    /// The timestamp obtained from the configured [`TimestampGenerator`]
    /// for this request, when the negotiated protocol version supports
    /// timestamp-in-flags and a generator is configured (spec.md §4.6
    /// "Timestamps"). Splicing it into the wire body is the caller's job
    /// (spec.md §1 non-goal: the core never encodes query bytes) — this
    /// is the value it should use.
    ///
    /// [`TimestampGenerator`]: crate::policies::timestamp_generator::TimestampGenerator
    pub generated_timestamp: Option<i64>,
}

enum AttemptOutcome {
    NextHost,
    Terminal(DriverError),
}

type AttemptResult = DriverResult<(QueryResult, Endpoint, ConsistencyLevel, Option<i64>)>;

/// spec.md §4.6: drives one logical request through a query plan.
pub struct RequestHandler {
    hosts: Arc<HostMap>,
    policies: Policies,
    prepare_handler: Arc<PrepareHandler>,
    max_schema_agreement_wait: Duration,
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler").finish_non_exhaustive()
    }
}

impl RequestHandler {
    pub fn new(
        hosts: Arc<HostMap>,
        policies: Policies,
        prepare_handler: Arc<PrepareHandler>,
        max_schema_agreement_wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            policies,
            prepare_handler,
            max_schema_agreement_wait,
        })
    }

    /// spec.md §4.6: runs the whole state machine to completion and
    /// delivers exactly one outcome.
    pub async fn execute(self: &Arc<Self>, spec: RequestSpec) -> DriverResult<(QueryResult, RequestInfo)> {
        let plan: Arc<Vec<Arc<Host>>> = Arc::new(self.policies.load_balancing.new_query_plan(&self.hosts).await);
        if plan.is_empty() {
            return Err(DriverError::NoHostAvailable(NoHostAvailableError::new()));
        }

        let cursor = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(NoHostAvailableError::new()));
        let active_branches = Arc::new(AtomicUsize::new(1));
        let (tx, mut rx) = mpsc::channel::<AttemptResult>(4);

        let mut handles = vec![self.spawn_branch(
            Arc::clone(&plan),
            Arc::clone(&cursor),
            spec.clone(),
            Arc::clone(&errors),
            tx.clone(),
            Arc::clone(&active_branches),
        )];

        let speculative_count = Arc::new(AtomicUsize::new(0));
        if spec.options.is_idempotent {
            let mut spec_plan = self.policies.speculative_execution.new_plan();
            let handler = Arc::clone(self);
            let plan2 = Arc::clone(&plan);
            let cursor2 = Arc::clone(&cursor);
            let errors2 = Arc::clone(&errors);
            let active2 = Arc::clone(&active_branches);
            let tx2 = tx.clone();
            let spec2 = spec.clone();
            let speculative_count2 = Arc::clone(&speculative_count);
            handles.push(tokio::spawn(async move {
                while let Some(delay) = spec_plan.next_execution() {
                    tokio::time::sleep(delay).await;
                    if tx2.is_closed() {
                        break;
                    }
                    speculative_count2.fetch_add(1, Ordering::SeqCst);
                    active2.fetch_add(1, Ordering::SeqCst);
                    handler.clone().run_branch(
                        Arc::clone(&plan2),
                        Arc::clone(&cursor2),
                        spec2.clone(),
                        Arc::clone(&errors2),
                        tx2.clone(),
                        Arc::clone(&active2),
                    ).await;
                }
            }));
        }
        drop(tx);

        let outcome = rx.recv().await;
        for handle in handles {
            handle.abort();
        }

        match outcome {
            Some(Ok((result, endpoint, consistency, generated_timestamp))) => {
                // spec.md §4.6 step 7: only a schema-changing response
                // needs agreement checked; every other result type is
                // vacuously "in agreement" since it didn't move the
                // schema that could disagree.
                let is_schema_in_agreement = match &result {
                    QueryResult::SchemaChange(_) => self.poll_schema_agreement().await,
                    _ => true,
                };
                Ok((
                    result,
                    RequestInfo {
                        host: endpoint,
                        speculative_execution_count: speculative_count.load(Ordering::SeqCst) as u32,
                        achieved_consistency: consistency,
                        is_schema_in_agreement,
                        generated_timestamp,
                    },
                ))
            }
            Some(Err(e)) => Err(e),
            None => Err(DriverError::NoHostAvailable(NoHostAvailableError::new())),
        }
    }

    /// spec.md §4.6 step 7 / schema-agreement polling: compares every up,
    /// non-ignored host's last-seen `schema_version` (populated by the
    /// Control Connection from `system.local`/`system.peers`, see
    /// `control.rs::apply_local_row`/`apply_peer_rows`) until they all
    /// match or `max_schema_agreement_wait` elapses.
    async fn poll_schema_agreement(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.max_schema_agreement_wait;
        loop {
            if self.schema_versions_agree().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn schema_versions_agree(&self) -> bool {
        let mut versions: Vec<uuid::Uuid> = Vec::new();
        for host in self.hosts.values().await {
            if !host.is_up() || matches!(host.distance().await, Distance::Ignored) {
                continue;
            }
            match host.info().await.schema_version {
                Some(v) => versions.push(v),
                None => return false,
            }
        }
        versions.windows(2).all(|pair| pair[0] == pair[1])
    }

    fn spawn_branch(
        self: &Arc<Self>,
        plan: Arc<Vec<Arc<Host>>>,
        cursor: Arc<AtomicUsize>,
        spec: RequestSpec,
        errors: Arc<Mutex<NoHostAvailableError>>,
        tx: mpsc::Sender<AttemptResult>,
        active_branches: Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.run_branch(plan, cursor, spec, errors, tx, active_branches).await;
        })
    }

    async fn run_branch(
        self: Arc<Self>,
        plan: Arc<Vec<Arc<Host>>>,
        cursor: Arc<AtomicUsize>,
        spec: RequestSpec,
        errors: Arc<Mutex<NoHostAvailableError>>,
        tx: mpsc::Sender<AttemptResult>,
        active_branches: Arc<AtomicUsize>,
    ) {
        loop {
            let idx = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(host) = plan.get(idx) else { break };
            match self.try_host(host, &spec, &errors).await {
                Ok(outcome) => {
                    let _ = tx.send(Ok(outcome)).await;
                    return;
                }
                Err(AttemptOutcome::NextHost) => continue,
                Err(AttemptOutcome::Terminal(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        if active_branches.fetch_sub(1, Ordering::SeqCst) == 1 {
            let combined = NoHostAvailableError {
                errors: std::mem::take(&mut errors.lock().await.errors),
            };
            let _ = tx.send(Err(DriverError::NoHostAvailable(combined))).await;
        }
    }

    /// spec.md §4.6 steps 2-5: borrow a connection on `host`, send the
    /// frame, and loop locally for same-host retries (UNPREPARED
    /// re-prepare, retry-same-host decisions) without returning control to
    /// the branch's plan cursor.
    async fn try_host(
        &self,
        host: &Arc<Host>,
        spec: &RequestSpec,
        errors: &Mutex<NoHostAvailableError>,
    ) -> Result<(QueryResult, Endpoint, ConsistencyLevel, Option<i64>), AttemptOutcome> {
        let mut consistency = spec.options.consistency;
        let mut retry_count = 0u32;
        let mut previous: Option<Arc<Connection>> = None;
        let mut kind = spec.kind.clone();

        loop {
            let keyspace = match &kind {
                RequestKind::Prepared { keyspace, .. } => keyspace.as_deref(),
                RequestKind::Simple { .. } | RequestKind::Batch { .. } => None,
            };
            let conn = match host.pool().borrow_connection(keyspace, previous.as_ref()).await {
                Ok(c) => c,
                Err(e) => {
                    record(errors, host.endpoint(), e).await;
                    return Err(AttemptOutcome::NextHost);
                }
            };

            // spec.md §4.6 "Timestamps": obtain one whenever the
            // negotiated protocol version can carry it and a generator is
            // configured. Splicing it into `body` is the caller's job
            // (the pre-encoded bytes-in/bytes-out boundary above); the
            // handler's responsibility ends at generating the value and
            // surfacing it via `RequestInfo`.
            let generated_timestamp = if conn.protocol_version().supports_timestamp_in_flags() {
                self.policies.timestamp_generator.as_ref().map(|gen| gen.next())
            } else {
                None
            };

            let request = match &kind {
                RequestKind::Simple { body } => Request::Query { body: body.clone() },
                RequestKind::Prepared { info, body, .. } => Request::Execute {
                    id: info.id.clone(),
                    result_metadata_id: info.result_metadata_id.clone(),
                    body: body.clone(),
                },
                RequestKind::Batch { body } => Request::Batch { body: body.clone() },
            };

            let response = conn.send_stream(request, spec.options.read_timeout).await;
            match response {
                Ok(Response::Result(result)) => return Ok((result, host.endpoint(), consistency, generated_timestamp)),
                Ok(Response::Error(err)) => {
                    if err.is_unprepared() {
                        if let RequestKind::Prepared { query, keyspace, .. } = &kind {
                            match conn.prepare_once(query, keyspace.as_deref(), spec.options.read_timeout).await {
                                Ok(new_info) => {
                                    if let RequestKind::Prepared { info, .. } = &mut kind {
                                        *info = new_info;
                                    }
                                    previous = Some(conn);
                                    continue;
                                }
                                Err(e) => {
                                    record(errors, host.endpoint(), e).await;
                                    return Err(AttemptOutcome::NextHost);
                                }
                            }
                        }
                    }

                    let decision = self.consult_retry_policy(&err, consistency, retry_count, spec.options.is_idempotent);
                    match decision {
                        RetryDecision::RetrySameHost { new_consistency } => {
                            retry_count += 1;
                            if let Some(c) = new_consistency {
                                consistency = c;
                            }
                            previous = Some(conn);
                            continue;
                        }
                        RetryDecision::RetryNextHost { .. } => {
                            record(errors, host.endpoint(), DriverError::Response(err)).await;
                            return Err(AttemptOutcome::NextHost);
                        }
                        RetryDecision::Rethrow => {
                            return Err(AttemptOutcome::Terminal(DriverError::Response(err)));
                        }
                        RetryDecision::Ignore => {
                            return Ok((QueryResult::Void, host.endpoint(), consistency, generated_timestamp));
                        }
                    }
                }
                Ok(other) => {
                    return Err(AttemptOutcome::Terminal(crate::error::internal_err!(
                        "unexpected response to a user request: {other:?}"
                    )))
                }
                Err(DriverError::OperationTimedOut(_)) => {
                    // spec.md §4.3 `checkHealth`: a stalling connection's
                    // `timedOutOperations` counter just advanced past the
                    // read timeout on `conn`; give the pool a chance to
                    // evict it before the next attempt can borrow it again.
                    host.check_health().await;
                    let decision = self.policies.retry.on_read_timeout(consistency, retry_count, spec.options.is_idempotent);
                    match decision {
                        RetryDecision::RetrySameHost { new_consistency } => {
                            retry_count += 1;
                            if let Some(c) = new_consistency {
                                consistency = c;
                            }
                            previous = Some(conn);
                            continue;
                        }
                        RetryDecision::RetryNextHost { .. } => {
                            record(errors, host.endpoint(), DriverError::OperationTimedOut(spec.options.read_timeout)).await;
                            return Err(AttemptOutcome::NextHost);
                        }
                        RetryDecision::Rethrow => {
                            return Err(AttemptOutcome::Terminal(DriverError::OperationTimedOut(spec.options.read_timeout)));
                        }
                        RetryDecision::Ignore => {
                            return Ok((QueryResult::Void, host.endpoint(), consistency, generated_timestamp));
                        }
                    }
                }
                Err(DriverError::BusyConnection) => {
                    record(errors, host.endpoint(), DriverError::BusyConnection).await;
                    return Err(AttemptOutcome::NextHost);
                }
                Err(e) => {
                    record(errors, host.endpoint(), e).await;
                    return Err(AttemptOutcome::NextHost);
                }
            }
        }
    }

    fn consult_retry_policy(
        &self,
        err: &crate::frame::ResponseError,
        consistency: ConsistencyLevel,
        retry_count: u32,
        is_idempotent: bool,
    ) -> RetryDecision {
        match err.kind {
            ResponseErrorKind::ReadTimeout => {
                self.policies.retry.on_read_timeout(consistency, retry_count, is_idempotent)
            }
            ResponseErrorKind::WriteTimeout => {
                self.policies.retry.on_write_timeout(consistency, retry_count, is_idempotent)
            }
            ResponseErrorKind::Unavailable => self.policies.retry.on_unavailable(consistency, retry_count),
            _ => self.policies.retry.on_request_error(err, is_idempotent),
        }
    }

    pub fn prepare_handler(&self) -> &Arc<PrepareHandler> {
        &self.prepare_handler
    }
}

async fn record(errors: &Mutex<NoHostAvailableError>, endpoint: Endpoint, error: DriverError) {
    errors.lock().await.push(endpoint, error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::auth::NoneAuthProvider;
    use crate::conn::ConnectionConfig;
    use crate::config::{PoolingOptions, SocketOptions};
    use crate::host::{Host, HostInfo};
    use crate::host_map::HostMap;
    use crate::prepare::PrepareHandler;
    use crate::prepare::PreparedCache;

    #[test]
    fn consistency_level_is_copy_for_cheap_threading_across_retries() {
        fn assert_copy<T: Copy>() {}
        assert_copy::<ConsistencyLevel>();
    }

    fn test_config() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig {
            socket_options: SocketOptions::default(),
            pooling_options: PoolingOptions::default(),
            auth_provider: Arc::new(NoneAuthProvider),
            requested_max_version: None,
        })
    }

    async fn handler_with_hosts() -> (Arc<RequestHandler>, Arc<HostMap>) {
        let hosts = Arc::new(HostMap::new());
        let prepare_handler = Arc::new(PrepareHandler::new(
            Arc::new(PreparedCache::new(100)),
            false,
            false,
            Duration::from_secs(1),
        ));
        let handler = RequestHandler::new(
            Arc::clone(&hosts),
            Policies::default(),
            prepare_handler,
            Duration::from_millis(300),
        );
        (handler, hosts)
    }

    async fn up_host(hosts: &Arc<HostMap>, addr: &str, schema_version: Option<uuid::Uuid>) -> Arc<Host> {
        let host = Host::new(
            Endpoint::new(addr.parse().unwrap()),
            Policies::default().reconnection.new_schedule(),
            test_config(),
        );
        host.set_info(HostInfo {
            schema_version,
            ..HostInfo::default()
        })
        .await;
        host.set_distance(Distance::Local, crate::pool::PoolTarget(0)).await;
        hosts.upsert(Arc::clone(&host)).await;
        host
    }

    #[tokio::test]
    async fn schema_versions_agree_when_every_up_host_reports_the_same_version() {
        let (handler, hosts) = handler_with_hosts().await;
        let v = uuid::Uuid::new_v4();
        up_host(&hosts, "127.0.0.1:9001", Some(v)).await;
        up_host(&hosts, "127.0.0.1:9002", Some(v)).await;
        assert!(handler.schema_versions_agree().await);
    }

    #[tokio::test]
    async fn schema_versions_disagree_when_an_up_host_reports_a_different_version() {
        let (handler, hosts) = handler_with_hosts().await;
        up_host(&hosts, "127.0.0.1:9003", Some(uuid::Uuid::new_v4())).await;
        up_host(&hosts, "127.0.0.1:9004", Some(uuid::Uuid::new_v4())).await;
        assert!(!handler.schema_versions_agree().await);
    }

    #[tokio::test]
    async fn poll_schema_agreement_times_out_when_versions_never_converge() {
        let (handler, hosts) = handler_with_hosts().await;
        up_host(&hosts, "127.0.0.1:9005", Some(uuid::Uuid::new_v4())).await;
        up_host(&hosts, "127.0.0.1:9006", Some(uuid::Uuid::new_v4())).await;
        let start = tokio::time::Instant::now();
        assert!(!handler.poll_schema_agreement().await);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
