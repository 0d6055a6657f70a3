//! Record types shared by the sampler, the speed-test runner and the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One measurement of system and network state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    /// Mean latency over the reachable targets; `None` when unreachable.
    pub latency_ms: Option<f64>,
    pub unreachable: bool,
    /// Health checks and throughput taken with the sample. Not logged to CSV.
    #[serde(default)]
    pub network: NetworkHealth,
}

impl Sample {
    /// Build a sample from host metrics and an optional probe latency.
    ///
    /// A missing or non-finite latency marks the sample unreachable.
    pub fn new(timestamp: DateTime<Utc>, host: HostMetrics, latency_ms: Option<f64>) -> Self {
        let latency_ms = latency_ms.filter(|ms| ms.is_finite() && *ms >= 0.0);
        Self {
            timestamp,
            cpu_percent: host.cpu_percent,
            memory_percent: host.memory_percent,
            disk_percent: host.disk_percent,
            unreachable: latency_ms.is_none(),
            latency_ms,
            network: NetworkHealth::default(),
        }
    }

    pub fn with_network(mut self, network: NetworkHealth) -> Self {
        self.network = network;
        self
    }
}

/// Per-tick measurements beyond reachability.
///
/// Each field is `None` when its check is disabled or failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealth {
    /// Interface receive rate since the previous sample, in Mbit/s.
    pub rx_mbps: Option<f64>,
    /// Interface transmit rate since the previous sample, in Mbit/s.
    pub tx_mbps: Option<f64>,
    /// System resolver lookup time for the health-check domain.
    pub dns_ms: Option<f64>,
    /// Time to first byte of the health-check URL.
    pub http_ttfb_ms: Option<f64>,
    pub http_status: Option<u16>,
}

/// Instantaneous CPU, memory and disk utilisation in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

/// Outcome of one speed-test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTestStatus {
    Success,
    Failure,
    Timeout,
}

impl fmt::Display for SpeedTestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpeedTestStatus::Success => "success",
            SpeedTestStatus::Failure => "failure",
            SpeedTestStatus::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Result of one external speed-test invocation.
///
/// Numeric fields are only populated when `status` is `Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub timestamp: DateTime<Utc>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub status: SpeedTestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpeedTestResult {
    pub fn success(timestamp: DateTime<Utc>, download_mbps: f64, upload_mbps: f64, ping_ms: Option<f64>) -> Self {
        Self {
            timestamp,
            download_mbps: Some(download_mbps),
            upload_mbps: Some(upload_mbps),
            ping_ms,
            status: SpeedTestStatus::Success,
            error: None,
        }
    }

    pub fn failure(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self::unsuccessful(timestamp, SpeedTestStatus::Failure, error)
    }

    pub fn timeout(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self::unsuccessful(timestamp, SpeedTestStatus::Timeout, error)
    }

    fn unsuccessful(timestamp: DateTime<Utc>, status: SpeedTestStatus, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            download_mbps: None,
            upload_mbps: None,
            ping_ms: None,
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SpeedTestStatus::Success
    }
}

/// One CSV row: a sample plus the speed test that completed since the
/// previous row, if any.
///
/// Field order is the column order of the log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub latency_ms: Option<f64>,
    pub unreachable: bool,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub speedtest_status: Option<SpeedTestStatus>,
}

/// Column names in file order.
pub const CSV_HEADER: [&str; 10] = [
    "timestamp",
    "cpu_percent",
    "memory_percent",
    "disk_percent",
    "latency_ms",
    "unreachable",
    "download_mbps",
    "upload_mbps",
    "ping_ms",
    "speedtest_status",
];

impl LogRecord {
    /// Merge a sample with an optional speed-test result.
    ///
    /// Values are rounded to two decimals for the log.
    pub fn new(sample: &Sample, speed: Option<&SpeedTestResult>) -> Self {
        Self {
            timestamp: sample.timestamp,
            cpu_percent: round2_f32(sample.cpu_percent),
            memory_percent: round2_f32(sample.memory_percent),
            disk_percent: round2_f32(sample.disk_percent),
            latency_ms: sample.latency_ms.map(round2),
            unreachable: sample.unreachable,
            download_mbps: speed.and_then(|s| s.download_mbps).map(round2),
            upload_mbps: speed.and_then(|s| s.upload_mbps).map(round2),
            ping_ms: speed.and_then(|s| s.ping_ms).map(round2),
            speedtest_status: speed.map(|s| s.status),
        }
    }

    /// Whether the row has a usable latency.
    pub fn is_reachable(&self) -> bool {
        !self.unreachable && self.latency_ms.is_some()
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round2_f32(v: f32) -> f32 {
    if v.is_finite() {
        (v * 100.0).round() / 100.0
    } else {
        0.0
    }
}
