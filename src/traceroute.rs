//! Traceroute diagnostics, run automatically when the connection drops.
//!
//! Like speed tests, at most one traceroute is in flight; further triggers
//! are dropped while it runs.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Output kept per report.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// How to run traceroute and where to.
#[derive(Debug, Clone, PartialEq)]
pub struct TracerouteConfig {
    /// Host traced; a probe target with port, scheme or path is accepted.
    pub target: String,
    /// Executable; `None` uses the platform's traceroute.
    pub command: Option<String>,
    /// Arguments placed before the target; `None` picks platform defaults.
    pub args: Option<Vec<String>>,
    pub timeout: Duration,
}

impl TracerouteConfig {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            command: None,
            args: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// One finished traceroute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerouteReport {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub success: bool,
    /// Numbered hop lines found in the output.
    pub hops: usize,
    pub output: String,
}

/// Runs traceroutes one at a time.
#[derive(Debug, Clone)]
pub struct TracerouteRunner {
    config: TracerouteConfig,
    slot: Arc<Semaphore>,
}

impl TracerouteRunner {
    pub fn new(config: TracerouteConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Spawn a traceroute in its own task unless one is running.
    ///
    /// `done` receives the report. Returns false when the trigger was dropped.
    pub fn spawn<F, Fut>(&self, done: F) -> bool
    where
        F: FnOnce(TracerouteReport) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            tracing::debug!("Traceroute not started: previous run still in progress");
            return false;
        };

        let runner = self.clone();
        tokio::spawn(async move {
            let report = runner.run().await;
            drop(permit);
            done(report).await;
        });
        true
    }

    async fn run(&self) -> TracerouteReport {
        let host = trace_host(&self.config.target);
        let (program, mut args) = match (&self.config.command, &self.config.args) {
            (Some(cmd), args) => (cmd.clone(), args.clone().unwrap_or_default()),
            (None, args) => {
                let (program, defaults) = default_command();
                (program.to_string(), args.clone().unwrap_or(defaults))
            }
        };
        args.push(host.to_string());

        tracing::info!("Running traceroute to {}", host);

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let (success, output) = match tokio::time::timeout(self.config.timeout, child).await {
            Err(_) => (false, format!("traceroute timed out after {:?}", self.config.timeout)),
            Ok(Err(e)) => (false, format!("failed to run {}: {}", program, e)),
            Ok(Ok(out)) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                if !out.status.success() {
                    text.push_str(&String::from_utf8_lossy(&out.stderr));
                }
                (out.status.success(), text)
            }
        };
        let output = truncate(output, MAX_OUTPUT_BYTES);

        let report = TracerouteReport {
            timestamp: Utc::now(),
            target: host.to_string(),
            success,
            hops: count_hops(&output),
            output,
        };
        if report.success {
            tracing::info!("Traceroute to {} completed: {} hops", report.target, report.hops);
        } else {
            tracing::warn!("Traceroute to {} failed: {}", report.target, report.output.trim());
        }
        report
    }
}

#[cfg(windows)]
fn default_command() -> (&'static str, Vec<String>) {
    ("tracert", vec!["-d".into(), "-h".into(), "30".into()])
}

#[cfg(not(windows))]
fn default_command() -> (&'static str, Vec<String>) {
    let args = ["-n", "-q", "1", "-w", "2", "-m", "30"];
    ("traceroute", args.iter().map(|s| s.to_string()).collect())
}

/// Strip scheme, path and port from a probe target.
fn trace_host(target: &str) -> &str {
    let rest = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match authority.split_once(':') {
        // A single colon is a port; more than one is a bare IPv6 address.
        Some((host, port)) if !port.contains(':') => host,
        _ => authority,
    }
}

fn count_hops(output: &str) -> usize {
    static HOP: OnceLock<Regex> = OnceLock::new();
    let hop = HOP.get_or_init(|| Regex::new(r"^\s*\d+\s").expect("valid regex"));
    output.lines().filter(|line| hop.is_match(line)).count()
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_trace_host() {
        assert_eq!(trace_host("8.8.8.8"), "8.8.8.8");
        assert_eq!(trace_host("example.com:443"), "example.com");
        assert_eq!(trace_host("https://example.com/health"), "example.com");
        assert_eq!(trace_host("http://example.com:8080/x"), "example.com");
        assert_eq!(trace_host("[2001:db8::1]:53"), "2001:db8::1");
        assert_eq!(trace_host("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_count_hops() {
        let output = "traceroute to 8.8.8.8 (8.8.8.8), 30 hops max\n 1  192.168.1.1  1.123 ms\n 2  * \n10  8.8.8.8  12.0 ms\n";
        assert_eq!(count_hops(output), 3);
        assert_eq!(count_hops(""), 0);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("abc".to_string(), 10), "abc");
        assert_eq!(truncate("héllo".to_string(), 2), "h");
    }

    async fn run_once(runner: &TracerouteRunner) -> TracerouteReport {
        let (tx, rx) = oneshot::channel();
        assert!(runner.spawn(move |report| async move {
            let _ = tx.send(report);
        }));
        rx.await.unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_report_from_command_output() {
        let runner = TracerouteRunner::new(TracerouteConfig {
            target: "example.com:443".to_string(),
            command: Some("sh".to_string()),
            args: Some(vec![
                "-c".to_string(),
                r#"echo "traceroute to $1"; echo " 1  10.0.0.1  1.0 ms"; echo " 2  $1  9.0 ms""#.to_string(),
                "sh".to_string(),
            ]),
            timeout: Duration::from_secs(10),
        });

        let report = run_once(&runner).await;
        assert!(report.success);
        assert_eq!(report.target, "example.com");
        assert_eq!(report.hops, 2);
        assert!(report.output.contains("traceroute to example.com"));
        assert!(!runner.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_trigger_dropped_while_running() {
        let runner = TracerouteRunner::new(TracerouteConfig {
            target: "10.0.0.1".to_string(),
            command: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), "sleep 0.3".to_string(), "sh".to_string()]),
            timeout: Duration::from_secs(10),
        });

        let (tx, rx) = oneshot::channel();
        assert!(runner.spawn(move |report| async move {
            let _ = tx.send(report);
        }));
        assert!(runner.is_running());
        assert!(!runner.spawn(|_| async {}));

        assert!(rx.await.unwrap().success);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_missing_command_is_unsuccessful() {
        let mut config = TracerouteConfig::new("10.0.0.1");
        config.command = Some("/nonexistent/traceroute".to_string());
        let report = run_once(&TracerouteRunner::new(config)).await;
        assert!(!report.success);
        assert!(report.output.contains("failed to run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_unsuccessful() {
        let runner = TracerouteRunner::new(TracerouteConfig {
            target: "10.0.0.1".to_string(),
            command: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), "sleep 5".to_string(), "sh".to_string()]),
            timeout: Duration::from_millis(200),
        });
        let report = run_once(&runner).await;
        assert!(!report.success);
        assert!(report.output.contains("timed out"));
    }
}
