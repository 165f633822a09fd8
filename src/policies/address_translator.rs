//! Address translation (spec.md §4.4.1, §9): rewrites the `rpc_address`
//! read off a peer row before it becomes a dial target, e.g. for a cloud
//! deployment where nodes are reached via a fixed SNI proxy rather than
//! their advertised address.

use std::net::SocketAddr;

use crate::error::DriverResult;

/// `AddressTranslator { translate }` (spec.md §9).
#[async_trait::async_trait]
pub trait AddressTranslator: Send + Sync + std::fmt::Debug {
    async fn translate(&self, address: SocketAddr) -> DriverResult<SocketAddr>;
}

/// Identity translation: the default when no cloud bundle / proxy is
/// configured.
#[derive(Debug, Default)]
pub struct IdentityAddressTranslator;

#[async_trait::async_trait]
impl AddressTranslator for IdentityAddressTranslator {
    async fn translate(&self, address: SocketAddr) -> DriverResult<SocketAddr> {
        Ok(address)
    }
}
