//! Configuration module for netpulse.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Command line flags are applied on top by `main`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::metrics::HealthCheckConfig;
use crate::probe::{ProbeConfig, ProbeKind};
use crate::speedtest::SpeedTestConfig;
use crate::traceroute::TracerouteConfig;

/// Shortest monitoring interval accepted.
pub const MIN_MONITORING_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("monitoring interval {0:?} is below the minimum of 500ms")]
    IntervalTooShort(Duration),
    #[error("no probe targets configured")]
    NoTargets,
}

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between monitoring ticks (default: 2s)
    pub monitoring_interval: Duration,
    /// Time between speed tests; `None` disables them (default: 30min)
    pub speedtest_interval: Option<Duration>,
    /// Probe targets (default: 8.8.8.8, 1.1.1.1)
    pub targets: Vec<String>,
    pub probe: ProbeKind,
    pub probe_timeout: Duration,
    /// CSV log file (default: "network_log.csv")
    pub log_path: PathBuf,
    /// Optional human-readable copy of the application log
    pub readable_log: Option<PathBuf>,
    /// Directory reports are written to (default: "reports")
    pub reports_dir: PathBuf,
    pub speedtest: SpeedTestConfig,
    /// Samples kept for live charts (default: 300)
    pub chart_capacity: usize,
    /// HTTP port for the dashboard; 0 disables it (default: 8080)
    pub http_port: u16,
    /// Domain resolved on every tick (default: "google.com")
    pub dns_check: Option<String>,
    /// URL fetched on every tick (default: "https://www.google.com")
    pub http_check: Option<String>,
    /// Trace the route to the first target on disconnect (default: on)
    pub traceroute: bool,
    pub traceroute_command: Option<String>,
    pub traceroute_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(2),
            speedtest_interval: Some(Duration::from_secs(30 * 60)),
            targets: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            probe: ProbeKind::Ping,
            probe_timeout: Duration::from_secs(2),
            log_path: PathBuf::from("network_log.csv"),
            readable_log: None,
            reports_dir: PathBuf::from("reports"),
            speedtest: SpeedTestConfig::default(),
            chart_capacity: 300,
            http_port: 8080,
            dns_check: Some("google.com".to_string()),
            http_check: Some("https://www.google.com".to_string()),
            traceroute: true,
            traceroute_command: None,
            traceroute_timeout: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPULSE_INTERVAL_SECS`: monitoring interval in seconds (default: 2)
    /// - `NETPULSE_SPEEDTEST_INTERVAL_MIN`: speed-test interval in minutes, 0 disables (default: 30)
    /// - `NETPULSE_TARGETS`: comma separated probe targets
    /// - `NETPULSE_PROBE`: ping, tcp, http or dns (default: ping)
    /// - `NETPULSE_PROBE_TIMEOUT_SECS`: per-probe timeout (default: 2)
    /// - `NETPULSE_LOG_PATH`: CSV log path (default: "network_log.csv")
    /// - `NETPULSE_READABLE_LOG`: readable log file (default: unset)
    /// - `NETPULSE_REPORTS_DIR`: reports directory (default: "reports")
    /// - `NETPULSE_SPEEDTEST_CMD`, `NETPULSE_SPEEDTEST_ARGS`: speed-test executable and arguments
    /// - `NETPULSE_SPEEDTEST_TIMEOUT_SECS`: speed-test timeout (default: 90)
    /// - `NETPULSE_CHART_CAPACITY`: samples kept for charts (default: 300)
    /// - `NETPULSE_HTTP_PORT`: dashboard port, 0 disables (default: 8080)
    /// - `NETPULSE_DNS_CHECK`, `NETPULSE_HTTP_CHECK`: per-tick health-check domain and URL, "off" disables
    /// - `NETPULSE_TRACEROUTE`: on/off (default: on)
    /// - `NETPULSE_TRACEROUTE_CMD`, `NETPULSE_TRACEROUTE_TIMEOUT_SECS`: traceroute executable and timeout (default: 60)
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("NETPULSE_INTERVAL_SECS") {
            cfg.monitoring_interval = parse_secs("NETPULSE_INTERVAL_SECS", &v)?;
        }

        if let Some(v) = get("NETPULSE_SPEEDTEST_INTERVAL_MIN") {
            let minutes = parse_number("NETPULSE_SPEEDTEST_INTERVAL_MIN", &v)?;
            cfg.speedtest_interval = minutes_to_interval(minutes);
        }

        if let Some(v) = get("NETPULSE_TARGETS") {
            cfg.targets = split_targets(&v);
        }

        if let Some(v) = get("NETPULSE_PROBE") {
            cfg.probe = v.parse().map_err(|e: crate::probe::ProbeError| ConfigError::Invalid {
                key: "NETPULSE_PROBE",
                value: v.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(v) = get("NETPULSE_PROBE_TIMEOUT_SECS") {
            cfg.probe_timeout = parse_secs("NETPULSE_PROBE_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("NETPULSE_LOG_PATH") {
            cfg.log_path = PathBuf::from(v);
        }

        cfg.readable_log = get("NETPULSE_READABLE_LOG").map(PathBuf::from);

        if let Some(v) = get("NETPULSE_REPORTS_DIR") {
            cfg.reports_dir = PathBuf::from(v);
        }

        cfg.speedtest.command = get("NETPULSE_SPEEDTEST_CMD");
        cfg.speedtest.args = get("NETPULSE_SPEEDTEST_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect());

        if let Some(v) = get("NETPULSE_SPEEDTEST_TIMEOUT_SECS") {
            cfg.speedtest.timeout = parse_secs("NETPULSE_SPEEDTEST_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("NETPULSE_CHART_CAPACITY") {
            cfg.chart_capacity = v.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "NETPULSE_CHART_CAPACITY",
                value: v.clone(),
                reason: "expected a non-negative integer".to_string(),
            })?;
        }

        if let Some(v) = get("NETPULSE_HTTP_PORT") {
            cfg.http_port = v.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "NETPULSE_HTTP_PORT",
                value: v.clone(),
                reason: "expected a port number".to_string(),
            })?;
        }

        if let Some(v) = get("NETPULSE_DNS_CHECK") {
            cfg.dns_check = unless_off(&v);
        }

        if let Some(v) = get("NETPULSE_HTTP_CHECK") {
            cfg.http_check = unless_off(&v);
        }

        if let Some(v) = get("NETPULSE_TRACEROUTE") {
            cfg.traceroute = unless_off(&v).is_some();
        }

        cfg.traceroute_command = get("NETPULSE_TRACEROUTE_CMD");

        if let Some(v) = get("NETPULSE_TRACEROUTE_TIMEOUT_SECS") {
            cfg.traceroute_timeout = parse_secs("NETPULSE_TRACEROUTE_TIMEOUT_SECS", &v)?;
        }

        Ok(cfg)
    }

    /// Check the configuration before handing it to the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring_interval < MIN_MONITORING_INTERVAL {
            return Err(ConfigError::IntervalTooShort(self.monitoring_interval));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "probe_timeout",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// One probe per configured target.
    pub fn probe_configs(&self) -> Vec<ProbeConfig> {
        self.targets
            .iter()
            .map(|target| ProbeConfig::new(self.probe, target, self.probe_timeout))
            .collect()
    }

    /// Health checks run with every sample, if any are enabled.
    pub fn health_checks(&self) -> Option<HealthCheckConfig> {
        if self.dns_check.is_none() && self.http_check.is_none() {
            return None;
        }
        Some(HealthCheckConfig {
            dns_domain: self.dns_check.clone(),
            http_url: self.http_check.clone(),
            timeout: self.probe_timeout,
        })
    }

    /// Traceroute to the first target, if enabled.
    pub fn traceroute_config(&self) -> Option<TracerouteConfig> {
        if !self.traceroute {
            return None;
        }
        let target = self.targets.first()?;
        let mut config = TracerouteConfig::new(target);
        config.command = self.traceroute_command.clone();
        config.timeout = self.traceroute_timeout;
        Some(config)
    }
}

/// `None` for the usual spellings of "disabled".
fn unless_off(value: &str) -> Option<String> {
    let value = value.trim();
    match value.to_ascii_lowercase().as_str() {
        "off" | "none" | "false" | "0" | "no" => None,
        _ => Some(value.to_string()),
    }
}

/// Speed-test interval from minutes; zero disables the trigger.
pub fn minutes_to_interval(minutes: f64) -> Option<Duration> {
    if minutes > 0.0 {
        Duration::try_from_secs_f64(minutes * 60.0).ok()
    } else {
        None
    }
}

/// Convert a user supplied number of seconds.
pub fn secs_to_duration(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        key,
        value: secs.to_string(),
        reason: e.to_string(),
    })
}

/// Split a comma separated target list, dropping empty entries.
pub fn split_targets(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number(key: &'static str, value: &str) -> Result<f64, ConfigError> {
    match value.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a non-negative number".to_string(),
        }),
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    secs_to_duration(key, parse_number(key, value)?)
}
