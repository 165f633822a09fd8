//! Recognized configuration options (spec.md §6), grouped the way the
//! teacher groups its connection/pooling knobs across
//! `conn/params/connect_params_builder.rs` and `conn/command_options.rs`:
//! a `#[derive(Clone, Debug, Default, Serialize, Deserialize)]` builder
//! with field setters and a validating `build()`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};
use crate::policies::Policies;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolOptions {
    pub port: u16,
    pub max_version: Option<u8>,
    pub no_compact: bool,
    pub max_schema_agreement_wait: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            port: 9042,
            max_version: None,
            no_compact: false,
            max_schema_agreement_wait: Duration::from_secs(10),
        }
    }
}

/// Per-distance core connection-pool sizes (spec.md §6 `pooling`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoreConnectionsPerHost {
    pub local: u16,
    pub remote: u16,
    pub ignored: u16,
}

impl Default for CoreConnectionsPerHost {
    fn default() -> Self {
        Self {
            local: 2,
            remote: 1,
            ignored: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolingOptions {
    pub heart_beat_interval: Duration,
    pub warmup: bool,
    pub core_connections_per_host: CoreConnectionsPerHost,
    pub max_requests_per_connection: u32,
    pub coalescing_threshold: usize,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            heart_beat_interval: Duration::from_millis(30_000),
            warmup: true,
            core_connections_per_host: CoreConnectionsPerHost::default(),
            // 128 for 1-byte stream ids, 2048 otherwise (spec.md §6); the
            // default here assumes modern (wide-stream) protocol versions
            // and is clamped down by `Connection::open` when negotiation
            // settles on a legacy version.
            max_requests_per_connection: 2048,
            coalescing_threshold: 65536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub defunct_read_timeout_threshold: u32,
    pub keep_alive: bool,
    pub keep_alive_delay: Duration,
    pub tcp_no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(12_000),
            defunct_read_timeout_threshold: 64,
            keep_alive: true,
            keep_alive_delay: Duration::ZERO,
            tcp_no_delay: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub consistency: u16,
    pub fetch_size: u32,
    pub prepare: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            consistency: LOCAL_ONE,
            fetch_size: 5000,
            prepare: false,
        }
    }
}

/// `localOne`, matching the CQL native-protocol consistency enumeration
/// (the full enumeration lives with the row/type codec collaborator;
/// the core only needs this one well-known default).
pub const LOCAL_ONE: u16 = 0x000A;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingOptions {
    pub copy_buffer: bool,
    pub use_undefined_as_unset: bool,
    pub use_bigint_as_long: bool,
    pub use_bigint_as_varint: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            copy_buffer: true,
            use_undefined_as_unset: true,
            use_bigint_as_long: false,
            use_bigint_as_varint: false,
        }
    }
}

/// Named bag of per-profile overrides (spec.md §3 "Execution Profile").
/// Unspecified fields inherit from the client defaults at resolution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub consistency: Option<u16>,
    pub serial_consistency: Option<u16>,
    pub read_timeout: Option<Duration>,
}

pub const DEFAULT_PROFILE: &str = "default";

/// The fully assembled client configuration (spec.md §6). Built via
/// [`ClientOptionsBuilder`].
#[derive(Clone)]
pub struct ClientOptions {
    pub contact_points: Vec<String>,
    pub local_datacenter: Option<String>,
    pub protocol_options: ProtocolOptions,
    pub pooling: PoolingOptions,
    pub socket_options: SocketOptions,
    pub query_options: QueryOptions,
    pub encoding: EncodingOptions,
    pub max_prepared: usize,
    pub refresh_schema_delay: Duration,
    pub is_metadata_sync_enabled: bool,
    pub prepare_on_all_hosts: bool,
    pub re_prepare_on_up: bool,
    pub new_node_delay: Duration,
    pub new_nodes_up: bool,
    pub profiles: HashMap<String, ExecutionProfile>,
    pub policies: Policies,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("contact_points", &self.contact_points)
            .field("local_datacenter", &self.local_datacenter)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    pub fn profile(&self, name: &str) -> ExecutionProfile {
        self.profiles.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct ClientOptionsBuilder {
    contact_points: Vec<String>,
    local_datacenter: Option<String>,
    protocol_options: ProtocolOptions,
    pooling: PoolingOptions,
    socket_options: SocketOptions,
    query_options: QueryOptions,
    encoding: EncodingOptions,
    max_prepared: Option<usize>,
    refresh_schema_delay: Option<Duration>,
    is_metadata_sync_enabled: Option<bool>,
    prepare_on_all_hosts: Option<bool>,
    re_prepare_on_up: Option<bool>,
    new_node_delay: Option<Duration>,
    new_nodes_up: Option<bool>,
    profiles: HashMap<String, ExecutionProfile>,
    policies: Option<Policies>,
}

impl ClientOptionsBuilder {
    pub fn contact_points(mut self, points: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.contact_points = points.into_iter().map(Into::into).collect();
        self
    }

    pub fn local_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.local_datacenter = Some(dc.into());
        self
    }

    pub fn protocol_options(mut self, options: ProtocolOptions) -> Self {
        self.protocol_options = options;
        self
    }

    pub fn pooling(mut self, options: PoolingOptions) -> Self {
        self.pooling = options;
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    pub fn query_options(mut self, options: QueryOptions) -> Self {
        self.query_options = options;
        self
    }

    pub fn encoding(mut self, options: EncodingOptions) -> Self {
        self.encoding = options;
        self
    }

    pub fn max_prepared(mut self, n: usize) -> Self {
        self.max_prepared = Some(n);
        self
    }

    pub fn refresh_schema_delay(mut self, d: Duration) -> Self {
        self.refresh_schema_delay = Some(d);
        self
    }

    pub fn metadata_sync_enabled(mut self, enabled: bool) -> Self {
        self.is_metadata_sync_enabled = Some(enabled);
        self
    }

    pub fn prepare_on_all_hosts(mut self, enabled: bool) -> Self {
        self.prepare_on_all_hosts = Some(enabled);
        self
    }

    pub fn re_prepare_on_up(mut self, enabled: bool) -> Self {
        self.re_prepare_on_up = Some(enabled);
        self
    }

    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn profile(mut self, name: impl Into<String>, profile: ExecutionProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    pub fn build(mut self) -> DriverResult<ClientOptions> {
        if self.contact_points.is_empty() {
            return Err(DriverError::ArgumentError(
                "at least one contact point is required".into(),
            ));
        }
        self.profiles.entry(DEFAULT_PROFILE.to_string()).or_default();
        Ok(ClientOptions {
            contact_points: self.contact_points,
            local_datacenter: self.local_datacenter,
            protocol_options: self.protocol_options,
            pooling: self.pooling,
            socket_options: self.socket_options,
            query_options: self.query_options,
            encoding: self.encoding,
            max_prepared: self.max_prepared.unwrap_or(500),
            refresh_schema_delay: self.refresh_schema_delay.unwrap_or(Duration::from_millis(1000)),
            is_metadata_sync_enabled: self.is_metadata_sync_enabled.unwrap_or(true),
            prepare_on_all_hosts: self.prepare_on_all_hosts.unwrap_or(true),
            re_prepare_on_up: self.re_prepare_on_up.unwrap_or(true),
            new_node_delay: self.new_node_delay.unwrap_or(Duration::from_millis(1000)),
            new_nodes_up: self.new_nodes_up.unwrap_or(true),
            profiles: self.profiles,
            policies: self.policies.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_at_least_one_contact_point() {
        let result = ClientOptions::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn build_fills_the_mandatory_default_profile() {
        let options = ClientOptions::builder()
            .contact_points(["127.0.0.1"])
            .build()
            .unwrap();
        assert!(options.profiles.contains_key(DEFAULT_PROFILE));
    }
}
