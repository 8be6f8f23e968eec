pub mod http;
pub mod https;

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::sniff::SniffError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection timed out after {0}s")]
    ConnectionTimeout(u64),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("proxy refused tunnel with status {0}")]
    TunnelRefused(u16),
    #[error("client hello rejected: {0}")]
    Sniff(#[from] SniffError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connect to the upstream proxy with a bounded timeout.
pub async fn connect_with_timeout(addr: &str, timeout_secs: u64) -> Result<TcpStream, ProxyError> {
    tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| ProxyError::ConnectionTimeout(timeout_secs))?
    .map_err(ProxyError::Io)
}
