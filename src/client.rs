//! The Client facade (spec.md §2 item 12, §4 "Client facade"): the single
//! object an application holds. `connect` assembles every other
//! component; `execute`/`execute_prepared`/`batch` run one logical
//! request through the [`RequestHandler`]; `execute_concurrent_array`/
//! `execute_concurrent_stream` hand a parameter set to the
//! [`ConcurrentExecutor`]; `shutdown` tears the whole cluster session
//! down once, idempotently (spec.md §5 "Client shutdown() aborts all
//! Pools and the Control Connection; pending operations fail with a
//! shutdown error; emitted once; idempotent").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ClientOptions, DEFAULT_PROFILE};
use crate::conn::auth::AuthProvider;
use crate::conn::ConnectionConfig;
use crate::control::{ControlConnection, SystemRowsCodec};
use crate::error::{DriverError, DriverResult};
use crate::executor::{ConcurrentExecutor, ExecutorOptions, ParameterStream, ResultGroup};
use crate::frame::QueryResult;
use crate::host_map::HostMap;
use crate::metadata::Metadata;
use crate::policies::Policies;
use crate::prepare::PreparedCache;
use crate::prepare::PrepareHandler;
use crate::request_handler::{ExecutionOptions, RequestHandler, RequestInfo, RequestKind, RequestSpec};

/// spec.md §2 item 12: the cluster-wide session object. Cheap to clone
/// (every field is an `Arc`); applications are expected to hold one
/// `Arc<Client>` for the lifetime of the process, the way the teacher's
/// `Connection` is meant to be held for the lifetime of one logical
/// session.
pub struct Client {
    hosts: Arc<HostMap>,
    metadata: Arc<Metadata>,
    options: ClientOptions,
    prepare_handler: Arc<PrepareHandler>,
    request_handler: Arc<RequestHandler>,
    control: Arc<ControlConnection>,
    is_shut_down: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("contact_points", &self.options.contact_points)
            .field("is_shut_down", &self.is_shut_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Client {
    /// spec.md §4.4 "Initialization" + §4.7 + §4.6: resolves contact
    /// points, brings up the Control Connection (which in turn seeds the
    /// Host Map and opens the first connection pools), and wires the
    /// Prepare Handler and Request Handler over the shared topology.
    ///
    /// `auth_provider` and `row_codec` are the two capability
    /// collaborators this crate leaves to the embedding application
    /// (spec.md §1 non-goals: authentication mechanism specifics and CQL
    /// row/type decoding); pass [`crate::conn::auth::NoneAuthProvider`]
    /// when the cluster requires no authentication.
    pub async fn connect(
        options: ClientOptions,
        auth_provider: Arc<dyn AuthProvider>,
        row_codec: Arc<dyn SystemRowsCodec>,
    ) -> DriverResult<Arc<Client>> {
        let hosts = Arc::new(HostMap::new());
        let metadata = Arc::new(Metadata::new());

        let connection_config = Arc::new(ConnectionConfig {
            socket_options: options.socket_options.clone(),
            pooling_options: options.pooling.clone(),
            auth_provider,
            requested_max_version: options.protocol_options.max_version,
        });

        let cache = Arc::new(PreparedCache::new(options.max_prepared));
        let prepare_handler = Arc::new(PrepareHandler::new(
            Arc::clone(&cache),
            options.prepare_on_all_hosts,
            options.re_prepare_on_up,
            options.socket_options.read_timeout,
        ));

        let request_handler = RequestHandler::new(
            Arc::clone(&hosts),
            options.policies.clone(),
            Arc::clone(&prepare_handler),
            options.protocol_options.max_schema_agreement_wait,
        );

        let control = ControlConnection::init(
            &options,
            Arc::clone(&hosts),
            Arc::clone(&metadata),
            Arc::clone(&connection_config),
            Arc::clone(&prepare_handler),
            row_codec,
        )
        .await?;

        // spec.md §9 "Policy injection": the load-balancing policy's
        // `init` hook runs once the Control Connection has populated the
        // Host Map, not before.
        options.policies.load_balancing.init(&hosts).await;

        Ok(Arc::new(Client {
            hosts,
            metadata,
            options,
            prepare_handler,
            request_handler,
            control,
            is_shut_down: AtomicBool::new(false),
        }))
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn hosts(&self) -> &Arc<HostMap> {
        &self.hosts
    }

    pub fn prepare_handler(&self) -> &Arc<PrepareHandler> {
        &self.prepare_handler
    }

    /// spec.md §4.7 `prepare`.
    pub async fn prepare(&self, query: &str, keyspace: Option<&str>) -> DriverResult<crate::conn::PreparedInfo> {
        self.ensure_not_shut_down()?;
        self.prepare_handler
            .prepare(query, keyspace, &self.hosts, self.options.policies.load_balancing.as_ref())
            .await
    }

    /// spec.md §3 "Execution Profile": resolves per-request options,
    /// falling back through the named profile to the client defaults.
    /// Callers that never touch profiles get `"default"`.
    pub fn resolve_execution_options(&self, profile_name: Option<&str>, is_idempotent: bool) -> ExecutionOptions {
        resolve_execution_options(&self.options, profile_name, is_idempotent)
    }

    /// spec.md §4.6 `execute` with a plain (unprepared) `QUERY` frame.
    /// `body` is the already-encoded query body (query text, consistency,
    /// bound values, flags) — encoding CQL values is the caller's
    /// responsibility (spec.md §1 non-goal).
    pub async fn execute(&self, body: Vec<u8>, options: ExecutionOptions) -> DriverResult<(QueryResult, RequestInfo)> {
        self.ensure_not_shut_down()?;
        self.request_handler
            .execute(RequestSpec {
                kind: RequestKind::Simple { body },
                options,
            })
            .await
    }

    /// spec.md §4.6 `execute` against a prepared statement: prepares (or
    /// reuses a cached preparation of) `query`, then runs an `EXECUTE`
    /// with `body` as the pre-encoded bound values.
    pub async fn execute_prepared(
        &self,
        query: &str,
        keyspace: Option<&str>,
        body: Vec<u8>,
        options: ExecutionOptions,
    ) -> DriverResult<(QueryResult, RequestInfo)> {
        self.ensure_not_shut_down()?;
        let info = self.prepare(query, keyspace).await?;
        self.request_handler
            .execute(RequestSpec {
                kind: RequestKind::Prepared {
                    query: query.to_string(),
                    keyspace: keyspace.map(String::from),
                    info,
                    body,
                },
                options,
            })
            .await
    }

    /// spec.md §4 item 12 `batch`: runs a pre-encoded `BATCH` body
    /// through the same query-plan/retry machinery as a single request.
    pub async fn batch(&self, body: Vec<u8>, options: ExecutionOptions) -> DriverResult<(QueryResult, RequestInfo)> {
        self.ensure_not_shut_down()?;
        self.request_handler
            .execute(RequestSpec {
                kind: RequestKind::Batch { body },
                options,
            })
            .await
    }

    /// spec.md §4.8 "Array mode": runs one pre-encoded query body per
    /// element of `bodies`, bounded by `executor_options.concurrency_level`.
    pub async fn execute_concurrent_array(
        self: &Arc<Self>,
        bodies: Vec<Vec<u8>>,
        executor_options: ExecutorOptions,
        request_options: ExecutionOptions,
    ) -> ResultGroup<(QueryResult, RequestInfo)> {
        let client = Arc::clone(self);
        ConcurrentExecutor::execute_array(bodies, executor_options, move |body| {
            let client = Arc::clone(&client);
            let request_options = request_options.clone();
            async move { client.execute(body, request_options).await }
        })
        .await
    }

    /// spec.md §4.8 "Stream mode": pulls query bodies from `stream` one
    /// at a time, never holding more than `executor_options.concurrency_level`
    /// requests in flight at once.
    pub async fn execute_concurrent_stream<S>(
        self: &Arc<Self>,
        stream: S,
        executor_options: ExecutorOptions,
        request_options: ExecutionOptions,
    ) -> DriverResult<ResultGroup<(QueryResult, RequestInfo)>>
    where
        S: ParameterStream<Vec<u8>> + Send + 'static,
    {
        let client = Arc::clone(self);
        ConcurrentExecutor::execute_stream(stream, executor_options, move |body| {
            let client = Arc::clone(&client);
            let request_options = request_options.clone();
            async move { client.execute(body, request_options).await }
        })
        .await
    }

    /// spec.md §5 "Client shutdown() aborts all Pools and the Control
    /// Connection; pending operations fail with a shutdown error;
    /// emitted once; idempotent". A second call is a cheap no-op.
    pub async fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.shutdown().await;
        for host in self.hosts.values().await {
            host.pool().shutdown().await;
        }
        self.hosts.reset().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    fn ensure_not_shut_down(&self) -> DriverResult<()> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            return Err(DriverError::Shutdown);
        }
        Ok(())
    }
}

fn resolve_execution_options(options: &ClientOptions, profile_name: Option<&str>, is_idempotent: bool) -> ExecutionOptions {
    let profile = options.profile(profile_name.unwrap_or(DEFAULT_PROFILE));
    ExecutionOptions {
        consistency: profile.consistency.unwrap_or(options.query_options.consistency),
        read_timeout: profile.read_timeout.unwrap_or(options.socket_options.read_timeout),
        is_idempotent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_execution_options_falls_back_to_client_defaults() {
        let options = ClientOptions::builder().contact_points(["127.0.0.1"]).build().unwrap();
        let default_consistency = options.query_options.consistency;
        let default_read_timeout = options.socket_options.read_timeout;

        let resolved = resolve_execution_options(&options, None, false);
        assert_eq!(resolved.consistency, default_consistency);
        assert_eq!(resolved.read_timeout, default_read_timeout);
        assert!(!resolved.is_idempotent);
    }

    #[test]
    fn resolve_execution_options_prefers_the_named_profile() {
        let mut profile = crate::config::ExecutionProfile::default();
        profile.consistency = Some(0x0009);
        let options = ClientOptions::builder()
            .contact_points(["127.0.0.1"])
            .profile("analytics", profile)
            .build()
            .unwrap();

        let resolved = resolve_execution_options(&options, Some("analytics"), true);
        assert_eq!(resolved.consistency, 0x0009);
        assert!(resolved.is_idempotent);
    }
}
