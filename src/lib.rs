//! Core driver runtime for a clustered, token-partitioned wide-column
//! database: topology discovery, pooled multiplexed connections, and
//! request routing.
//!
//! This crate owns the cluster-awareness and connection-management layer
//! of a CQL-like driver — contact-point resolution, the Control
//! Connection's `system.local`/`system.peers` topology refresh, per-host
//! connection pools, stream-multiplexed connections, retry/reconnection/
//! load-balancing/speculative-execution policies, the prepared-statement
//! cache, and the bounded-concurrency executor. Encoding and decoding of
//! CQL values themselves — the row/type codec — is deliberately left to
//! an embedding application or a sibling crate: [`Client::connect`]
//! accepts that collaborator as a [`control::SystemRowsCodec`], the same
//! way the driver accepts an [`conn::auth::AuthProvider`] rather than
//! baking in one authentication mechanism.
//!
//! Start with [`config::ClientOptions::builder`] to assemble a
//! configuration, then [`client::Client::connect`] to bring up a session.

#![deny(missing_debug_implementations)]

pub mod client;
pub mod config;
pub mod conn;
pub mod control;
pub mod error;
pub mod event_debouncer;
pub mod executor;
pub mod frame;
pub mod host;
pub mod host_map;
pub mod metadata;
pub mod policies;
pub mod pool;
pub mod prepare;
pub mod request_handler;

pub use client::Client;
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::{DriverError, DriverResult};
