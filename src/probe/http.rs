//! HTTP probe implementation.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use super::ProbeError;

/// Shared client so connection pools survive between ticks.
fn client() -> Result<&'static reqwest::Client, ProbeError> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if let Some(client) = CLIENT.get() {
        return Ok(client);
    }
    let client = reqwest::Client::builder()
        .user_agent(concat!("netpulse/", env!("CARGO_PKG_VERSION")))
        // Latency is measured to the target, not to a proxy.
        .no_proxy()
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;
    Ok(CLIENT.get_or_init(|| client))
}

/// Time to first byte and status of one HTTP request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpCheck {
    pub ttfb: Duration,
    pub status: u16,
}

/// Run an HTTP probe against the given address.
///
/// Returns the time to first byte: the body is not read. A 5xx answer
/// counts as a failed probe.
pub async fn run_http_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let url = http_url(address);
    let check = run_http_check(&url, timeout).await?;

    if check.status >= 500 {
        return Err(ProbeError::Network(format!("{} answered {}", url, check.status)));
    }

    Ok(check.ttfb)
}

/// Request `address` and report the time to first byte with whatever
/// status the server answered.
pub async fn run_http_check(address: &str, timeout: Duration) -> Result<HttpCheck, ProbeError> {
    let url = http_url(address);
    let start = Instant::now();

    let response = client()?
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    Ok(HttpCheck {
        ttfb: start.elapsed(),
        status: response.status().as_u16(),
    })
}

fn http_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
