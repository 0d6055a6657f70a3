//! Parsers for speed-test executable output.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::SpeedTestError;

/// Bandwidth figures extracted from one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: Option<f64>,
}

/// Parse speed-test output, trying JSON first and then plain text.
pub fn parse_output(output: &str) -> Result<Measurement, SpeedTestError> {
    let output = output.trim();
    if output.is_empty() {
        return Err(SpeedTestError::Parse("empty output".to_string()));
    }

    if let Some(m) = parse_json_document(output) {
        return Ok(m);
    }

    // Ookla can emit one JSON object per line; the result line comes last.
    if let Some(m) = output.lines().rev().find_map(|line| parse_json_document(line.trim())) {
        return Ok(m);
    }

    parse_text(output).ok_or_else(|| {
        let snippet: String = output.chars().take(200).collect();
        SpeedTestError::Parse(format!("unrecognised output: {}", snippet))
    })
}

fn parse_json_document(doc: &str) -> Option<Measurement> {
    if !doc.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(doc).ok()?;
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        if kind != "result" {
            return None;
        }
    }
    parse_ookla_json(&value).or_else(|| parse_cli_json(&value))
}

/// Ookla `speedtest --format=json`: bandwidth in bytes per second.
fn parse_ookla_json(value: &Value) -> Option<Measurement> {
    let download = value.get("download")?.get("bandwidth")?.as_f64()?;
    let upload = value.get("upload")?.get("bandwidth")?.as_f64()?;
    let ping_ms = value
        .get("ping")
        .and_then(|p| p.get("latency"))
        .and_then(Value::as_f64);

    Some(Measurement {
        download_mbps: download * 8.0 / 1_000_000.0,
        upload_mbps: upload * 8.0 / 1_000_000.0,
        ping_ms,
    })
}

/// `speedtest-cli --json`: bandwidth in bits per second.
fn parse_cli_json(value: &Value) -> Option<Measurement> {
    let download = value.get("download")?.as_f64()?;
    let upload = value.get("upload")?.as_f64()?;
    let ping_ms = value.get("ping").and_then(Value::as_f64);

    Some(Measurement {
        download_mbps: download / 1_000_000.0,
        upload_mbps: upload / 1_000_000.0,
        ping_ms,
    })
}

/// Human readable output from either tool, e.g. `Download: 93.12 Mbit/s`.
fn parse_text(output: &str) -> Option<Measurement> {
    static DOWNLOAD: OnceLock<Regex> = OnceLock::new();
    static UPLOAD: OnceLock<Regex> = OnceLock::new();
    static PING: OnceLock<Regex> = OnceLock::new();

    let download = DOWNLOAD.get_or_init(|| {
        Regex::new(r"(?i)download:\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\s*(?P<u>[kmg])(?:bit/s|bps)")
            .expect("valid regex")
    });
    let upload = UPLOAD.get_or_init(|| {
        Regex::new(r"(?i)upload:\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\s*(?P<u>[kmg])(?:bit/s|bps)")
            .expect("valid regex")
    });
    let ping = PING.get_or_init(|| {
        Regex::new(r"(?i)(?:ping|latency):\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\s*ms").expect("valid regex")
    });

    let download_mbps = capture_rate(download, output)?;
    let upload_mbps = capture_rate(upload, output)?;
    let ping_ms = ping
        .captures(output)
        .and_then(|c| c.name("v"))
        .and_then(|m| m.as_str().parse().ok());

    Some(Measurement {
        download_mbps,
        upload_mbps,
        ping_ms,
    })
}

fn capture_rate(re: &Regex, output: &str) -> Option<f64> {
    let caps = re.captures(output)?;
    let value: f64 = caps.name("v")?.as_str().parse().ok()?;
    let unit = caps.name("u")?.as_str();
    let factor = match unit.to_ascii_lowercase().as_str() {
        "k" => 0.001,
        "g" => 1000.0,
        _ => 1.0,
    };
    Some(value * factor)
}
