//! DNS and HTTP health checks taken alongside the reachability probes.

use std::time::Duration;

use crate::probe::{resolve_latency, run_http_check};

/// What the per-tick health checks contact.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Domain resolved through the system resolver; `None` skips the check.
    pub dns_domain: Option<String>,
    /// URL fetched for time to first byte; `None` skips the check.
    pub http_url: Option<String>,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            dns_domain: Some("google.com".to_string()),
            http_url: Some("https://www.google.com".to_string()),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Results of one round of health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthResults {
    pub dns_ms: Option<f64>,
    pub http_ttfb_ms: Option<f64>,
    pub http_status: Option<u16>,
}

/// Run both checks concurrently. Failures leave their fields empty.
pub async fn run_health_checks(config: &HealthCheckConfig) -> HealthResults {
    let dns = async {
        let domain = config.dns_domain.as_deref()?;
        match resolve_latency(domain, config.timeout).await {
            Ok(latency) => Some(millis(latency)),
            Err(e) => {
                tracing::debug!("DNS health check for {} failed: {}", domain, e);
                None
            }
        }
    };
    let http = async {
        let url = config.http_url.as_deref()?;
        match run_http_check(url, config.timeout).await {
            Ok(check) => Some(check),
            Err(e) => {
                tracing::debug!("HTTP health check for {} failed: {}", url, e);
                None
            }
        }
    };

    let (dns_ms, http) = tokio::join!(dns, http);
    HealthResults {
        dns_ms,
        http_ttfb_ms: http.map(|c| millis(c.ttfb)),
        http_status: http.map(|c| c.status),
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
