//! Metric sampling: host utilisation plus network reachability.

mod health;
mod host;

pub use health::*;
pub use host::*;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;

use crate::probe::{run_probe, ProbeConfig};
use crate::store::{NetworkHealth, Sample};

/// Source of samples for the monitoring tick.
#[async_trait]
pub trait Sampler: Send {
    /// Take one sample. Never fails: probe failures surface as an
    /// unreachable sample.
    async fn sample(&mut self) -> Sample;
}

/// Samples the local host with `sysinfo` and probes the configured targets.
pub struct MetricSampler {
    host: HostMonitor,
    probes: Vec<ProbeConfig>,
    health: Option<HealthCheckConfig>,
}

impl MetricSampler {
    pub fn new(probes: Vec<ProbeConfig>) -> Self {
        Self {
            host: HostMonitor::new(),
            probes,
            health: None,
        }
    }

    /// Also run DNS and HTTP health checks on every sample.
    pub fn with_health_checks(mut self, health: Option<HealthCheckConfig>) -> Self {
        self.health = health;
        self
    }

    /// Probe every target concurrently and average the successful latencies.
    async fn probe_targets(&self) -> Option<f64> {
        let mut set = JoinSet::new();
        for config in self.probes.iter().cloned() {
            set.spawn(async move {
                let result = run_probe(&config).await;
                (config, result)
            });
        }

        let mut latencies = Vec::with_capacity(self.probes.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(latency))) => latencies.push(latency.as_secs_f64() * 1000.0),
                Ok((config, Err(e))) if e.is_timeout() => {
                    tracing::debug!("Probe {} {} timed out", config.kind, config.address);
                }
                Ok((config, Err(e))) => {
                    tracing::warn!("Probe {} {} failed: {}", config.kind, config.address, e);
                }
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        }
    }
}

#[async_trait]
impl Sampler for MetricSampler {
    async fn sample(&mut self) -> Sample {
        let timestamp = Utc::now();
        let host = self.host.refresh();
        let throughput = self.host.throughput();

        let health = async {
            match &self.health {
                Some(config) => run_health_checks(config).await,
                None => HealthResults::default(),
            }
        };
        let (latency, health) = tokio::join!(self.probe_targets(), health);

        Sample::new(timestamp, host, latency).with_network(NetworkHealth {
            rx_mbps: throughput.map(|t| t.rx_mbps),
            tx_mbps: throughput.map(|t| t.tx_mbps),
            dns_ms: health.dns_ms,
            http_ttfb_ms: health.http_ttfb_ms,
            http_status: health.http_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_target_yields_unreachable_sample() {
        let probes = vec![ProbeConfig::new(ProbeKind::Tcp, "127.0.0.1:1", Duration::from_millis(300))];
        let mut sampler = MetricSampler::new(probes);
        let sample = sampler.sample().await;
        assert!(sample.unreachable);
        assert!(sample.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_probe_timeout_yields_unreachable_sample() {
        // TEST-NET-1 is never routed; the connect either hangs until the
        // timeout or fails immediately, and both must read as unreachable.
        let probes = vec![ProbeConfig::new(ProbeKind::Tcp, "192.0.2.1:9", Duration::from_millis(200))];
        let mut sampler = MetricSampler::new(probes);
        let sample = sampler.sample().await;
        assert!(sample.unreachable);
        assert!(sample.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_latency_averages_reachable_targets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let probes = vec![
            ProbeConfig::new(ProbeKind::Tcp, &addr.to_string(), Duration::from_secs(2)),
            ProbeConfig::new(ProbeKind::Tcp, "127.0.0.1:1", Duration::from_millis(300)),
        ];
        let mut sampler = MetricSampler::new(probes);
        let sample = sampler.sample().await;
        assert!(!sample.unreachable);
        assert!(sample.latency_ms.unwrap() < 2000.0);
    }

    #[tokio::test]
    async fn test_sample_carries_health_checks() {
        let health = HealthCheckConfig {
            dns_domain: Some("localhost".to_string()),
            http_url: None,
            timeout: Duration::from_secs(2),
        };
        let mut sampler = MetricSampler::new(Vec::new()).with_health_checks(Some(health));
        let sample = sampler.sample().await;
        assert!(sample.network.dns_ms.is_some());
        assert!(sample.network.http_status.is_none());
        assert!(sample.network.rx_mbps.is_some());

        let mut sampler = MetricSampler::new(Vec::new());
        assert!(sampler.sample().await.network.dns_ms.is_none());
    }

    #[tokio::test]
    async fn test_no_targets_is_unreachable() {
        let mut sampler = MetricSampler::new(Vec::new());
        assert!(sampler.sample().await.unreachable);
    }
}
