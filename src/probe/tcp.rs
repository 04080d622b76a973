//! TCP connect probe.

use super::ProbeError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Open and immediately drop a TCP connection to `address` (`host:port`).
pub async fn run_tcp_probe(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Network(format!("connect to {} failed: {}", address, e))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
