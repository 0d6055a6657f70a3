//! Ping probe implementation with native ICMP and command fallback.
//!
//! Native echo requests run on blocking sockets inside `spawn_blocking` so the
//! measured round trip is not inflated by executor scheduling.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Whether this process may open ICMP sockets at all.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier and sequence for one echo request, unique per process.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }

    // Unprivileged ICMP: macOS, or Linux with net.ipv4.ping_group_range set
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Run a ping probe against the given address.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let result = tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!(
                "Native ping to {} not permitted, falling back to command: {}",
                address,
                msg
            );
            run_ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

/// Which kind of ICMP socket carried the echo.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SocketKind {
    /// Replies include the IPv4 header and every ICMP message on the host.
    Raw,
    /// Unprivileged socket: the kernel rewrites the echo identifier to the
    /// socket's port and only delivers replies addressed to this socket.
    Dgram,
}

fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, SocketKind), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    Socket::new(domain, Type::RAW, Some(protocol))
        .map(|s| (s, SocketKind::Raw))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)).map(|s| (s, SocketKind::Dgram)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))
}

/// Send one echo request and wait for the matching reply.
fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (socket, kind) = open_icmp_socket(ip)?;
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let (packet, reply_type) = match ip {
        IpAddr::V4(_) => (build_echo_request(ICMP_ECHO_REQUEST, identifier, sequence, true), ICMP_ECHO_REPLY),
        // The kernel fills in the ICMPv6 checksum.
        IpAddr::V6(_) => (build_echo_request(ICMPV6_ECHO_REQUEST, identifier, sequence, false), ICMPV6_ECHO_REPLY),
    };

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        // SAFETY: recv initialized the first `len` bytes of `buf`
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_matching_reply(data, kind, reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check whether `data` is the echo reply for (identifier, sequence).
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message.
/// DGRAM sockets carry the kernel's identifier, so only type and sequence
/// are compared there.
fn is_matching_reply(data: &[u8], kind: SocketKind, reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = match data.first() {
        Some(&b) if kind == SocketKind::Raw && reply_type == ICMP_ECHO_REPLY && b >> 4 == 4 => {
            usize::from(b & 0x0F) * 4
        }
        _ => 0,
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };
    let identifier_matches = kind == SocketKind::Dgram || u16::from_be_bytes([icmp[4], icmp[5]]) == identifier;
    icmp[0] == reply_type && identifier_matches && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build a 64 byte echo request: 8 byte header plus a timestamp payload.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&nanos.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via the system command.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let output = Command::new("ping")
        .args(ping_args(timeout))
        .arg(address)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
            || stdout.contains("Request timed out")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

#[cfg(windows)]
fn ping_args(timeout: Duration) -> Vec<String> {
    let millis = timeout.as_millis().max(1);
    vec!["-n".into(), "1".into(), "-w".into(), millis.to_string()]
}

#[cfg(not(windows))]
fn ping_args(timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1);
    vec!["-c".into(), "1".into(), "-W".into(), secs.to_string()]
}

/// Parse ping command output for latency.
///
/// Accepts the per-reply `time=X ms` form (Linux, macOS, Windows) and the
/// rtt/round-trip summary lines.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static REPLY: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let reply = REPLY.get_or_init(|| {
        Regex::new(r"(?i)time[=<]\s*(?P<ms>[0-9]+(?:\.[0-9]+)?)\s*ms").expect("valid regex")
    });
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/")
            .expect("valid regex")
    });

    reply
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.name("ms"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
