//! Probe module for network reachability.
//!
//! Supports Ping, TCP connect, HTTP and DNS probes.

mod dns;
mod http;
mod ping;
mod tcp;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

/// The kind of probe used to decide whether a target is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Ping,
    Tcp,
    Http,
    Dns,
}

impl FromStr for ProbeKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" | "icmp" => Ok(ProbeKind::Ping),
            "tcp" => Ok(ProbeKind::Tcp),
            "http" | "https" => Ok(ProbeKind::Http),
            "dns" => Ok(ProbeKind::Dns),
            other => Err(ProbeError::Config(format!("unknown probe type: {}", other))),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Http => "http",
            ProbeKind::Dns => "dns",
        };
        f.write_str(name)
    }
}

/// Probe configuration for a single target.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    pub address: String,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(kind: ProbeKind, address: &str, timeout: Duration) -> Self {
        Self {
            kind,
            address: address.to_string(),
            timeout,
        }
    }
}

/// Run a probe with the given configuration.
///
/// Returns the measured round-trip latency. The whole probe, including name
/// resolution, is bounded by the configured timeout.
pub async fn run_probe(config: &ProbeConfig) -> Result<Duration, ProbeError> {
    let probe = async {
        match config.kind {
            ProbeKind::Ping => run_ping_probe(&config.address, config.timeout).await,
            ProbeKind::Tcp => run_tcp_probe(&config.address, config.timeout).await,
            ProbeKind::Http => run_http_probe(&config.address, config.timeout).await,
            ProbeKind::Dns => run_dns_probe(&config.address, config.timeout).await,
        }
    };

    let latency = tokio::time::timeout(config.timeout, probe)
        .await
        .map_err(|_| ProbeError::Timeout(config.timeout))??;

    if latency >= config.timeout {
        return Err(ProbeError::Timeout(config.timeout));
    }

    Ok(latency)
}
