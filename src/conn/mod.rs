//! The per-host connection layer: transport, framing handshake, stream
//! multiplexing, contact-point parsing, and authentication, grouped the
//! way the teacher groups its `conn/` module (`tcp_client`, `params`,
//! `authentication`, `connection_core`).

pub mod auth;
pub mod connection;
pub mod params;
pub mod socket;
pub mod stream_id;

pub use connection::{Connection, PreparedInfo};

use std::sync::Arc;

use crate::config::{PoolingOptions, SocketOptions};
use auth::AuthProvider;

/// Everything a pool needs to open a new connection to a host, bundled so
/// it can be shared (via `Arc`) across every `Host` without re-threading
/// five constructor parameters through the whole topology layer.
pub struct ConnectionConfig {
    pub socket_options: SocketOptions,
    pub pooling_options: PoolingOptions,
    pub auth_provider: Arc<dyn AuthProvider>,
    pub requested_max_version: Option<u8>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("socket_options", &self.socket_options)
            .field("pooling_options", &self.pooling_options)
            .finish_non_exhaustive()
    }
}
