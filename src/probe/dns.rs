//! DNS probe implementation using raw UDP packets.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::tcp::with_default_port;
use super::ProbeError;

/// Name queried by the probe.
const QUERY_NAME: &str = "example.com";

/// Run a DNS probe against the given DNS server address.
///
/// Sends a single A query and returns the time until a matching answer
/// without an error RCODE arrives.
pub async fn run_dns_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let target_addr = with_default_port(address, 53);

    let (packet, tx_id) = build_dns_query(QUERY_NAME)?;

    let bind_addr = if target_addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(&target_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 512];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let elapsed = start.elapsed();

    check_dns_response(&response[..n], tx_id)?;

    Ok(elapsed)
}

/// Time a lookup of `domain` through the system resolver.
///
/// This is what applications on the host experience, caches included.
pub async fn resolve_latency(domain: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    let mut addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((domain, 0)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to resolve {}: {}", domain, e)))?;
    let elapsed = start.elapsed();

    if addrs.next().is_none() {
        return Err(ProbeError::Network(format!("no addresses found for {}", domain)));
    }
    Ok(elapsed)
}

/// Validate the header of a DNS response against the query's transaction id.
fn check_dns_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // RCODE is the lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    Ok(())
}

/// Build a minimal recursive A/IN query for `name`.
///
/// Returns the packet and its transaction id.
fn build_dns_query(name: &str) -> Result<(Vec<u8>, u16), ProbeError> {
    let tx_id: u16 = rand::random();

    let mut packet = Vec::with_capacity(18 + name.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // standard query, RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    Ok((packet, tx_id))
}
