//! Transport abstraction (spec.md §1: "TLS ... loading" is an external
//! collaborator). `Connection` is generic over anything implementing
//! [`Transport`], so a caller can hand it a plain `TcpStream` or a
//! `rustls`-wrapped stream without this crate depending on a TLS stack —
//! mirrors the teacher's `TcpClient` enum-of-implementations
//! (`conn/tcp_client.rs`) but pushes the TLS variant out of the crate
//! entirely, since spec.md draws that line explicitly.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{DriverError, DriverResult};

/// Anything that can carry framed request/response bytes.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Opens a plain TCP connection with the configured connect timeout and
/// socket options (spec.md §6 `socketOptions`), grounded on the teacher's
/// `conn/tcp_client/async_plain_tcp_client.rs`.
pub async fn connect_plain_tcp(
    addr: std::net::SocketAddr,
    connect_timeout: Duration,
    tcp_no_delay: bool,
) -> DriverResult<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            DriverError::OperationTimedOut(connect_timeout)
        })??;
    stream.set_nodelay(tcp_no_delay)?;
    Ok(stream)
}
