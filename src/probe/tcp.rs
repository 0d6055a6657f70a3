//! TCP connect probe.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;

/// Port used when the address carries none.
const DEFAULT_TCP_PORT: u16 = 443;

/// Run a TCP probe against `host[:port]`.
///
/// Returns the time taken to complete the three-way handshake.
pub async fn run_tcp_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let target = with_default_port(address, DEFAULT_TCP_PORT);

    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to connect to {}: {}", target, e)))?;
    let elapsed = start.elapsed();

    drop(stream);
    Ok(elapsed)
}

/// Append `port` unless the address already names one.
///
/// Bare IPv6 literals are bracketed; `[::1]:80` style addresses pass through.
pub(crate) fn with_default_port(address: &str, port: u16) -> String {
    if address.starts_with('[') {
        if address.contains("]:") {
            return address.to_string();
        }
        return format!("{}:{}", address, port);
    }

    match address.matches(':').count() {
        0 => format!("{}:{}", address, port),
        1 => address.to_string(),
        _ => format!("[{}]:{}", address, port),
    }
}
