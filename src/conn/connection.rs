//! One TCP socket, frame-multiplexed over stream ids (spec.md §3
//! "Connection", §4.1).
//!
//! Lifecycle `opening -> open -> (closing) -> closed` (spec.md §3): `open`
//! performs the STARTUP/auth handshake, then spawns a reader task that
//! demultiplexes frames by stream id into the pending-response map and a
//! writer task that coalesces outbound frames, mirroring the teacher's
//! split of transport ownership across `ConnectionCore`
//! (`conn/connection_core.rs`) plus `logging_reader.rs`/`logging_writer.rs`
//! for the read/write halves, generalized here to background tasks
//! instead of blocking-call wrappers since this core is async-native.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};

use crate::config::{PoolingOptions, SocketOptions};
use crate::conn::auth::AuthProvider;
use crate::conn::socket::Transport;
use crate::conn::stream_id::StreamIdAllocator;
use crate::error::{DriverError, DriverResult};
use crate::frame::{
    self, Event, FrameHeader, ProtocolVersion, Request, Response, MAX_SUPPORTED_VERSION,
    MIN_SUPPORTED_VERSION,
};
use crate::host::Endpoint;

/// A cached prepare result: the one piece of a `PREPARE` response the
/// core needs to remember (spec.md §3 "Prepared Cache"); parameter/result
/// metadata bytes stay opaque, handed off to the row/type codec
/// collaborator on demand.
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    pub id: Vec<u8>,
    pub result_metadata_id: Option<Vec<u8>>,
    pub raw_metadata: Vec<u8>,
}

struct PendingOp {
    reply: oneshot::Sender<DriverResult<Response>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// One multiplexed connection to a single Host (spec.md §4.1).
pub struct Connection {
    endpoint: Endpoint,
    protocol_version: ProtocolVersion,
    keyspace: RwLock<Option<String>>,
    stream_ids: Mutex<StreamIdAllocator>,
    pending: Mutex<HashMap<i16, PendingOp>>,
    in_flight: AtomicUsize,
    timed_out_operations: AtomicU32,
    state: watch::Sender<ConnState>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    /// Broadcasts incoming `EVENT` frames (spec.md §4.1 "Event
    /// subscription"). `broadcast` rather than `mpsc` because both the
    /// pool (which ignores events on ordinary connections) and the Control
    /// Connection (which adopts exactly one connection and actually acts
    /// on them) need independent, on-demand subscriptions to the same
    /// stream without coordinating who "owns" it.
    events_tx: broadcast::Sender<Event>,
    last_activity: Arc<tokio::sync::Mutex<std::time::Instant>>,
    single_flight_prepares: Mutex<HashMap<(Option<String>, String), Arc<tokio::sync::Semaphore>>>,
    prepared_locally: RwLock<HashMap<(Option<String>, String), PreparedInfo>>,
}

enum WriteJob {
    Frame(Vec<u8>),
    Shutdown,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a socket, negotiates the protocol version, authenticates, and
    /// spawns the reader/writer tasks (spec.md §4.1 `open`).
    pub async fn open(
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        socket_options: &SocketOptions,
        pooling_options: &PoolingOptions,
        auth: Arc<dyn AuthProvider>,
        requested_max_version: Option<u8>,
    ) -> DriverResult<Arc<Connection>> {
        let (mut read_half, mut write_half) = tokio::io::split(transport);

        let version = negotiate_version(
            &mut read_half,
            &mut write_half,
            auth.as_ref(),
            requested_max_version.unwrap_or(MAX_SUPPORTED_VERSION),
        )
        .await?;

        // `max_stream_ids()` is the protocol's hard ceiling (127 on a
        // legacy 1-byte stream id, i16::MAX once wide streams are
        // negotiated); `max_requests_per_connection` (spec.md §6) lets an
        // application cap concurrency per connection below that ceiling.
        let capacity = (version.max_stream_ids() as u32).min(pooling_options.max_requests_per_connection) as i16;
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        // Bounded so a subscriber that stops polling (a closed control
        // connection) can only ever lag, never back up the reader task;
        // `recv` on a lagged receiver just skips forward (spec.md §4.1:
        // events "bypass the pending-response map" entirely).
        let (events_tx, _events_rx) = broadcast::channel(128);
        let (state_tx, _state_rx) = watch::channel(ConnState::Open);

        let conn = Arc::new(Connection {
            endpoint,
            protocol_version: version,
            keyspace: RwLock::new(None),
            stream_ids: Mutex::new(StreamIdAllocator::new(capacity)),
            pending: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            timed_out_operations: AtomicU32::new(0),
            state: state_tx,
            write_tx,
            events_tx,
            last_activity: Arc::new(tokio::sync::Mutex::new(std::time::Instant::now())),
            single_flight_prepares: Mutex::new(HashMap::new()),
            prepared_locally: RwLock::new(HashMap::new()),
        });

        spawn_writer_task(Arc::clone(&conn), write_half, pooling_options.coalescing_threshold, write_rx);
        spawn_reader_task(Arc::clone(&conn), read_half, version);
        spawn_heartbeat_task(Arc::clone(&conn), pooling_options.heart_beat_interval);
        let _ = socket_options;

        Ok(conn)
    }

    /// spec.md §4.1 "Event subscription": subscribes to this connection's
    /// incoming `EVENT` frames. Multiple independent subscribers are fine
    /// (the pool's background drain and, for an adopted connection, the
    /// Control Connection's event-handling loop).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Resolves once this connection transitions to `closed` (spec.md §3
    /// "Connection" lifecycle: "transitions to closed are terminal and
    /// emit `socketClose`"). Used by the Control Connection's event pump to
    /// notice its adopted connection dying without a dedicated callback
    /// registry.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow() == ConnState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn timed_out_operations(&self) -> u32 {
        self.timed_out_operations.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnState::Open
    }

    pub async fn keyspace(&self) -> Option<String> {
        self.keyspace.read().await.clone()
    }

    /// spec.md §4.1 `sendStream`: allocates a stream id, enqueues the
    /// frame, and waits for the matching response or the read timeout.
    pub async fn send_stream(&self, request: Request, read_timeout: Duration) -> DriverResult<Response> {
        if !self.is_connected() {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }
        let stream_id = {
            let mut ids = self.stream_ids.lock().await;
            ids.allocate().ok_or(DriverError::BusyConnection)?
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(stream_id, PendingOp { reply: tx });

        let bytes = frame::encode(&request, stream_id, self.protocol_version);
        if self.write_tx.send(WriteJob::Frame(bytes)).is_err() {
            self.fail_pending(stream_id).await;
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer task is gone",
            )));
        }

        let outcome = tokio::time::timeout(read_timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                result
            }
            Ok(Err(_canceled)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection closed before a response arrived",
                )))
            }
            Err(_timed_out) => {
                // The stream id stays reserved until the response actually
                // arrives (spec.md §4.1, §9): do not release it here.
                self.stream_ids.lock().await.mark_timed_out(stream_id);
                self.timed_out_operations.fetch_add(1, Ordering::SeqCst);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(DriverError::OperationTimedOut(read_timeout))
            }
        }
    }

    async fn fail_pending(&self, stream_id: i16) {
        self.pending.lock().await.remove(&stream_id);
        self.stream_ids.lock().await.release(stream_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// spec.md §4.1 `prepareOnce`: single-flight per `(keyspace, query)`
    /// on this connection.
    pub async fn prepare_once(
        &self,
        query: &str,
        keyspace: Option<&str>,
        read_timeout: Duration,
    ) -> DriverResult<PreparedInfo> {
        let key = (keyspace.map(String::from), query.to_string());
        if let Some(cached) = self.prepared_locally.read().await.get(&key) {
            return Ok(cached.clone());
        }

        let semaphore = {
            let mut inflight = self.single_flight_prepares.lock().await;
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(1))),
            )
        };
        let _permit = semaphore.acquire().await.expect("semaphore is never closed");

        // Another caller may have completed the prepare while we waited for
        // the permit.
        if let Some(cached) = self.prepared_locally.read().await.get(&key) {
            return Ok(cached.clone());
        }

        let response = self
            .send_stream(
                Request::Prepare {
                    query: query.to_string(),
                    keyspace: keyspace.map(String::from),
                },
                read_timeout,
            )
            .await?;
        let info = match response {
            Response::Result(crate::frame::QueryResult::Prepared {
                id,
                result_metadata_id,
                raw_metadata,
            }) => PreparedInfo {
                id,
                result_metadata_id,
                raw_metadata,
            },
            Response::Error(e) => return Err(DriverError::Response(e)),
            other => {
                return Err(crate::error::internal_err!(
                    "expected a Prepared result, got {other:?}"
                ))
            }
        };
        self.prepared_locally.write().await.insert(key.clone(), info.clone());
        self.single_flight_prepares.lock().await.remove(&key);
        Ok(info)
    }

    /// spec.md §4.1 `changeKeyspace`.
    pub async fn change_keyspace(&self, name: &str, read_timeout: Duration) -> DriverResult<()> {
        let response = self
            .send_stream(
                Request::Query {
                    body: encode_use_query_body(name),
                },
                read_timeout,
            )
            .await?;
        match response {
            Response::Result(_) => {
                *self.keyspace.write().await = Some(name.to_string());
                Ok(())
            }
            Response::Error(e) => Err(DriverError::Response(e)),
            other => Err(crate::error::internal_err!(
                "expected a Result for USE, got {other:?}"
            )),
        }
    }

    /// spec.md §4.1 `close`: idempotent, cancels all pending operations
    /// with a transport-error signal.
    pub async fn close(&self) {
        if *self.state.borrow() == ConnState::Closed {
            return;
        }
        let _ = self.state.send(ConnState::Closed);
        let _ = self.write_tx.send(WriteJob::Shutdown);
        let mut pending = self.pending.lock().await;
        for (_, op) in pending.drain() {
            let _ = op.reply.send(Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed",
            ))));
        }
        self.stream_ids.lock().await.release_all();
    }
}

fn encode_use_query_body(keyspace: &str) -> Vec<u8> {
    use byteorder::{BigEndian, WriteBytesExt};
    let mut body = Vec::new();
    let query = format!("USE \"{keyspace}\"");
    body.write_u32::<BigEndian>(query.len() as u32).unwrap();
    body.extend_from_slice(query.as_bytes());
    body.write_u16::<BigEndian>(0x000A).unwrap(); // LOCAL_ONE
    body.push(0x00); // no query flags
    body
}

fn spawn_writer_task(
    conn: Arc<Connection>,
    mut write_half: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    coalescing_threshold: usize,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    tokio::spawn(async move {
        let _ = &conn;
        let mut buf = Vec::new();
        loop {
            let first = match rx.recv().await {
                Some(WriteJob::Frame(bytes)) => bytes,
                Some(WriteJob::Shutdown) | None => break,
            };
            buf.clear();
            buf.extend_from_slice(&first);
            // Coalesce whatever has already queued up, up to the
            // threshold, instead of writing one frame per syscall
            // (spec.md §4.1 "flushed either on `coalescingThreshold` bytes
            // accumulated or on the next event-loop tick" — here "tick"
            // is whatever arrived by the time this task got scheduled).
            while buf.len() < coalescing_threshold {
                match rx.try_recv() {
                    Ok(WriteJob::Frame(more)) => buf.extend_from_slice(&more),
                    Ok(WriteJob::Shutdown) | Err(_) => break,
                }
            }
            if write_half.write_all(&buf).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_reader_task(
    conn: Arc<Connection>,
    mut read_half: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    version: ProtocolVersion,
) {
    tokio::spawn(async move {
        let mut header_buf = [0u8; crate::frame::HEADER_LEN];
        loop {
            if read_half.read_exact(&mut header_buf).await.is_err() {
                break;
            }
            let header = match FrameHeader::read_from(&header_buf[..]) {
                Ok(h) => h,
                Err(_) => break,
            };
            let mut body = vec![0u8; header.body_len as usize];
            if read_half.read_exact(&mut body).await.is_err() {
                break;
            }
            let _ = version;
            let parsed = frame::decode(&header, &body);
            match parsed {
                Ok(Response::Event(event)) => {
                    let _ = conn.events_tx.send(event);
                }
                Ok(response) => {
                    dispatch_response(&conn, header.stream_id, Ok(response)).await;
                }
                Err(e) => {
                    dispatch_response(&conn, header.stream_id, Err(DriverError::Io(e))).await;
                }
            }
        }
        conn.close().await;
    });
}

async fn dispatch_response(conn: &Arc<Connection>, stream_id: i16, result: DriverResult<Response>) {
    let op = conn.pending.lock().await.remove(&stream_id);
    conn.stream_ids.lock().await.release_timed_out(stream_id);
    if let Some(op) = op {
        let _ = op.reply.send(result);
    }
}

fn spawn_heartbeat_task(conn: Arc<Connection>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if !conn.is_connected() {
                break;
            }
            let outcome = conn.send_stream(Request::Options, interval).await;
            if let Err(e) = outcome {
                log::warn!("heartbeat failed for {}: {e}", conn.endpoint());
                conn.close().await;
                break;
            }
        }
    });
}

/// Negotiates the protocol version via STARTUP, downgrading once on a
/// protocol-version rejection, and drives the optional auth challenge loop
/// (spec.md §6: "MUST negotiate protocol version via the `USE_BETA /
/// SUPPORTED` handshake").
async fn negotiate_version(
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    write_half: &mut (impl tokio::io::AsyncWrite + Unpin),
    auth: &dyn AuthProvider,
    requested_max_version: u8,
) -> DriverResult<ProtocolVersion> {
    let mut candidate = requested_max_version.min(MAX_SUPPORTED_VERSION);
    loop {
        let version = ProtocolVersion::new(candidate);
        let mut options = HashMap::new();
        options.insert("CQL_VERSION".to_string(), "3.0.0".to_string());
        let startup = Request::Startup { options };
        let bytes = frame::encode(&startup, 0, version);
        write_half.write_all(&bytes).await?;

        let response = read_one_frame(read_half, version).await?;
        match response {
            Response::Ready => return Ok(version),
            Response::Authenticate { .. } => {
                run_auth_exchange(read_half, write_half, auth, version).await?;
                return Ok(version);
            }
            Response::Error(e) if e.kind == crate::frame::ResponseErrorKind::ProtocolError => {
                if candidate <= MIN_SUPPORTED_VERSION {
                    return Err(DriverError::NotSupported(
                        candidate,
                        "no mutually supported protocol version",
                    ));
                }
                candidate -= 1;
                continue;
            }
            Response::Error(e) => return Err(DriverError::Response(e)),
            other => {
                return Err(crate::error::internal_err!(
                    "unexpected response to STARTUP: {other:?}"
                ))
            }
        }
    }
}

async fn run_auth_exchange(
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    write_half: &mut (impl tokio::io::AsyncWrite + Unpin),
    auth: &dyn AuthProvider,
    version: ProtocolVersion,
) -> DriverResult<()> {
    let mut token = auth.initial_response().await?;
    loop {
        let request = Request::AuthResponse { token };
        let bytes = frame::encode(&request, 0, version);
        write_half.write_all(&bytes).await?;
        match read_one_frame(read_half, version).await? {
            Response::AuthSuccess { .. } => return Ok(()),
            Response::AuthChallenge { token: Some(challenge) } => {
                token = auth.evaluate_challenge(&challenge).await?;
            }
            Response::AuthChallenge { token: None } => {
                token = auth.evaluate_challenge(&[]).await?;
            }
            Response::Error(e) => {
                return Err(DriverError::AuthenticationError(e.message));
            }
            other => {
                return Err(crate::error::internal_err!(
                    "unexpected response during authentication: {other:?}"
                ))
            }
        }
    }
}

async fn read_one_frame(
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    version: ProtocolVersion,
) -> DriverResult<Response> {
    let mut header_buf = [0u8; crate::frame::HEADER_LEN];
    read_half.read_exact(&mut header_buf).await?;
    let header = FrameHeader::read_from(&header_buf[..])?;
    let mut body = vec![0u8; header.body_len as usize];
    read_half.read_exact(&mut body).await?;
    let _ = version;
    Ok(frame::decode(&header, &body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::auth::NoneAuthProvider;
    use crate::frame::{FrameHeader, FrameFlags, ResponseOpcode};

    fn write_response_frame(buf: &mut Vec<u8>, version: ProtocolVersion, opcode: ResponseOpcode, body: &[u8]) {
        let header = FrameHeader {
            version,
            response: true,
            flags: FrameFlags::empty(),
            stream_id: 0,
            opcode: opcode as u8,
            body_len: body.len() as u32,
        };
        header.write_to(&mut *buf).unwrap();
        buf.extend_from_slice(body);
    }

    #[tokio::test]
    async fn negotiate_version_accepts_ready_at_the_requested_version() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            // Drain the STARTUP frame the client sends before replying.
            let mut header_buf = [0u8; crate::frame::HEADER_LEN];
            server.read_exact(&mut header_buf).await.unwrap();
            let header = FrameHeader::read_from(&header_buf[..]).unwrap();
            let mut body = vec![0u8; header.body_len as usize];
            server.read_exact(&mut body).await.unwrap();

            let mut reply = Vec::new();
            write_response_frame(&mut reply, header.version, ResponseOpcode::Ready, &[]);
            server.write_all(&reply).await.unwrap();
            server.flush().await.unwrap();
        });

        let (mut read_half, mut write_half) = tokio::io::split(&mut client);
        let version = negotiate_version(&mut read_half, &mut write_half, &NoneAuthProvider, MAX_SUPPORTED_VERSION)
            .await
            .unwrap();
        assert_eq!(version.raw(), MAX_SUPPORTED_VERSION);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn negotiate_version_downgrades_on_protocol_error_until_accepted() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            loop {
                let mut header_buf = [0u8; crate::frame::HEADER_LEN];
                if server.read_exact(&mut header_buf).await.is_err() {
                    break;
                }
                let header = FrameHeader::read_from(&header_buf[..]).unwrap();
                let mut body = vec![0u8; header.body_len as usize];
                server.read_exact(&mut body).await.unwrap();

                let mut reply = Vec::new();
                if header.version.raw() > MIN_SUPPORTED_VERSION {
                    // Reject every version above the floor with a
                    // PROTOCOL_ERROR (code 0x000A) so the client is forced
                    // to keep downgrading one step at a time.
                    let mut error_body = Vec::new();
                    error_body.extend_from_slice(&0x000A_u32.to_be_bytes());
                    error_body.extend_from_slice(&2u16.to_be_bytes());
                    error_body.extend_from_slice(b"no");
                    write_response_frame(&mut reply, header.version, ResponseOpcode::Error, &error_body);
                    server.write_all(&reply).await.unwrap();
                    server.flush().await.unwrap();
                    continue;
                }
                write_response_frame(&mut reply, header.version, ResponseOpcode::Ready, &[]);
                server.write_all(&reply).await.unwrap();
                server.flush().await.unwrap();
                break;
            }
        });

        let (mut read_half, mut write_half) = tokio::io::split(&mut client);
        let version = negotiate_version(&mut read_half, &mut write_half, &NoneAuthProvider, MAX_SUPPORTED_VERSION)
            .await
            .unwrap();
        assert_eq!(version.raw(), MIN_SUPPORTED_VERSION);
        server_task.await.unwrap();
    }
}
