//! The driver's error taxonomy.
//!
//! Mirrors spec.md §7: one semantic kind per failure mode observable by a
//! caller, plus a couple of internal/implementation variants used the way
//! the teacher crate uses `HdbError::Impl`/`HdbError::ImplDetailed`.

use std::fmt;

use crate::frame::ResponseError;
use crate::host::Endpoint;

/// A list specifying categories of [`DriverError`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    /// Invalid configuration or API misuse; never retried.
    #[error("invalid argument: {0}")]
    ArgumentError(String),

    /// Server rejected credentials during the STARTUP/AUTH_RESPONSE handshake.
    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    /// The selected connection is saturated (`inFlight >= maxRequestsPerConnection`).
    ///
    /// Never surfaced to the caller: the Request Handler treats this as a
    /// signal to move on to the next host in the query plan.
    #[error("connection is busy")]
    BusyConnection,

    /// An invariant of this driver was violated.
    #[error("driver internal error: {0}")]
    DriverInternalError(String),

    /// Every host in the query plan failed; aggregates the per-host reasons.
    #[error("no host was available to serve the request")]
    NoHostAvailable(NoHostAvailableError),

    /// A requested capability is not supported by the negotiated protocol version.
    #[error("not supported by negotiated protocol version {0}: {1}")]
    NotSupported(u8, &'static str),

    /// A per-request or per-metadata-query timeout elapsed.
    #[error("operation timed out after {0:?}")]
    OperationTimedOut(std::time::Duration),

    /// The server responded with a typed `ERROR` frame.
    #[error("server responded with an error")]
    Response(#[from] ResponseError),

    /// I/O failure underneath a connection.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The client (or the pool/control connection) has been shut down.
    #[error("driver has been shut down")]
    Shutdown,
}

/// Aggregates a `{endpoint -> error}` map across every host tried for one
/// logical request. Terminal for the request that produced it.
#[derive(Debug, Default)]
pub struct NoHostAvailableError {
    pub errors: Vec<(Endpoint, DriverError)>,
}

impl NoHostAvailableError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, endpoint: Endpoint, error: DriverError) {
        self.errors.push((endpoint, error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for NoHostAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no host available, tried {} host(s): ", self.errors.len())?;
        for (i, (endpoint, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{endpoint} => {err}")?;
        }
        Ok(())
    }
}

impl From<NoHostAvailableError> for DriverError {
    fn from(e: NoHostAvailableError) -> Self {
        Self::NoHostAvailable(e)
    }
}

/// Shorthand for `Result<T, DriverError>`, the way the teacher exposes `HdbResult`.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Builds a [`DriverError::DriverInternalError`] with a formatted message,
/// the way the teacher's `impl_err!` builds `HdbError::ImplDetailed`.
macro_rules! internal_err {
    ($($arg:tt)*) => {
        $crate::error::DriverError::DriverInternalError(format!($($arg)*))
    };
}
pub(crate) use internal_err;
