//! HTTP request handlers.

use super::AppState;
use crate::report::render::{escape, svg_line_chart, Line};
use crate::report::{Point, Report, ReportFiles, TimeRange};
use crate::scheduler::{SchedulerError, SchedulerState};
use crate::store::{Sample, SpeedTestResult};
use crate::traceroute::TracerouteReport;

use axum::{
    http::StatusCode,
    extract::State,
    response::{Html, IntoResponse, Json, Response},
};
use serde::Serialize;

// ============================================================================
// Templates (simple string replacement)
// ============================================================================

const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");
const DASHBOARD_TEMPLATE: &str = include_str!("templates/dashboard.html");

/// Speed-test rows shown on the dashboard.
const DASHBOARD_SPEED_TESTS: usize = 10;

// ============================================================================
// Dashboard
// ============================================================================

pub async fn handle_dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let chart = state.scheduler.chart();
    let samples = chart.samples().await;
    let speed_tests = chart.speed_tests().await;

    let latency: Vec<Point> = samples
        .iter()
        .filter_map(|s| s.latency_ms.map(|v| point(s, v)))
        .collect();
    let outages: Vec<Point> = samples
        .iter()
        .filter(|s| s.unreachable)
        .map(|s| point(s, 0.0))
        .collect();
    let cpu: Vec<Point> = samples.iter().map(|s| point(s, s.cpu_percent as f64)).collect();
    let memory: Vec<Point> = samples.iter().map(|s| point(s, s.memory_percent as f64)).collect();
    let disk: Vec<Point> = samples.iter().map(|s| point(s, s.disk_percent as f64)).collect();
    let series = |f: fn(&Sample) -> Option<f64>| -> Vec<Point> {
        samples.iter().filter_map(|s| f(s).map(|v| point(s, v))).collect()
    };
    let dns = series(|s| s.network.dns_ms);
    let ttfb = series(|s| s.network.http_ttfb_ms);
    let rx = series(|s| s.network.rx_mbps);
    let tx = series(|s| s.network.tx_mbps);

    let latency_chart = svg_line_chart(
        "Latency",
        " ms",
        &[Line {
            label: "latency",
            color: "#2b7bb9",
            points: &latency,
        }],
        &outages,
    );
    let system_chart = svg_line_chart(
        "System utilisation",
        "%",
        &[
            Line { label: "cpu", color: "#d9534f", points: &cpu },
            Line { label: "memory", color: "#5cb85c", points: &memory },
            Line { label: "disk", color: "#f0ad4e", points: &disk },
        ],
        &[],
    );
    let health_chart = svg_line_chart(
        "DNS and HTTP",
        " ms",
        &[
            Line { label: "dns", color: "#6f42c1", points: &dns },
            Line { label: "http ttfb", color: "#17a2b8", points: &ttfb },
        ],
        &outages,
    );
    let throughput_chart = svg_line_chart(
        "Throughput",
        " Mbps",
        &[
            Line { label: "rx", color: "#2b7bb9", points: &rx },
            Line { label: "tx", color: "#d9534f", points: &tx },
        ],
        &[],
    );

    let latest = match samples.last() {
        Some(s) if s.unreachable => "DISCONNECTED".to_string(),
        Some(s) => format!("{:.2} ms", s.latency_ms.unwrap_or_default()),
        None => "N/A".to_string(),
    };
    let http_status = samples
        .last()
        .and_then(|s| s.network.http_status)
        .map(|code| code.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let traceroute = state.scheduler.last_traceroute().await;

    let content = DASHBOARD_TEMPLATE
        .replace("{{state}}", &format!("{:?}", state.scheduler.state()))
        .replace("{{latest}}", &latest)
        .replace("{{targets}}", &escape(&state.config.targets.join(", ")))
        .replace("{{probe}}", &state.config.probe.to_string())
        .replace("{{sample_count}}", &samples.len().to_string())
        .replace("{{capacity}}", &chart.capacity().await.to_string())
        .replace("{{latency_chart}}", &latency_chart)
        .replace("{{system_chart}}", &system_chart)
        .replace("{{health_chart}}", &health_chart)
        .replace("{{throughput_chart}}", &throughput_chart)
        .replace("{{http_status}}", &http_status)
        .replace("{{traceroute}}", &traceroute_section(traceroute.as_ref()))
        .replace("{{speed_rows}}", &speed_rows(&speed_tests));

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", "netpulse")
        .replace("{{content}}", &content);

    Html(page)
}

fn point(sample: &Sample, value: f64) -> Point {
    Point {
        time: sample.timestamp,
        value,
    }
}

fn speed_rows(results: &[SpeedTestResult]) -> String {
    if results.is_empty() {
        return "<tr><td colspan=\"5\" class=\"empty\">No speed tests yet</td></tr>".to_string();
    }
    let fmt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string());

    results
        .iter()
        .rev()
        .take(DASHBOARD_SPEED_TESTS)
        .map(|r| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td title=\"{}\">{}</td></tr>",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                fmt(r.download_mbps),
                fmt(r.upload_mbps),
                fmt(r.ping_ms),
                escape(r.error.as_deref().unwrap_or("")),
                r.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn traceroute_section(report: Option<&TracerouteReport>) -> String {
    match report {
        None => "<p class=\"empty\">No traceroute yet</p>".to_string(),
        Some(r) => format!(
            "<p>{} to {}: {} hops{}</p>\n<pre>{}</pre>",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            escape(&r.target),
            r.hops,
            if r.success { "" } else { " (failed)" },
            escape(&r.output)
        ),
    }
}

// ============================================================================
// API: State and chart data
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: SchedulerState,
    pub speedtest_running: bool,
    pub traceroute_running: bool,
    pub monitoring_interval_secs: f64,
    pub speedtest_interval_secs: Option<f64>,
    pub latest: Option<Sample>,
}

async fn state_response(state: &AppState) -> StateResponse {
    let config = state.scheduler.config();
    StateResponse {
        state: state.scheduler.state(),
        speedtest_running: state.scheduler.is_speedtest_running(),
        traceroute_running: state.scheduler.is_traceroute_running(),
        monitoring_interval_secs: config.monitoring_interval.as_secs_f64(),
        speedtest_interval_secs: config.speedtest_interval.map(|d| d.as_secs_f64()),
        latest: state.scheduler.chart().latest().await,
    }
}

pub async fn handle_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state_response(&state).await)
}

pub async fn handle_samples(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.chart().samples().await)
}

pub async fn handle_speedtests(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.chart().speed_tests().await)
}

// ============================================================================
// API: Controls
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn control_response(state: &AppState, result: Result<(), SchedulerError>) -> Response {
    match result {
        Ok(()) => Json(state_response(state).await).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

pub async fn handle_start(State(state): State<AppState>) -> Response {
    let result = state.scheduler.start_configured().await;
    control_response(&state, result).await
}

pub async fn handle_stop(State(state): State<AppState>) -> Response {
    let result = state.scheduler.stop().await;
    control_response(&state, result).await
}

pub async fn handle_pause(State(state): State<AppState>) -> Response {
    let result = state.scheduler.pause().await;
    control_response(&state, result).await
}

pub async fn handle_resume(State(state): State<AppState>) -> Response {
    let result = state.scheduler.resume().await;
    control_response(&state, result).await
}

#[derive(Debug, Serialize)]
pub struct SpeedTestTriggerResponse {
    pub started: bool,
}

pub async fn handle_speedtest(State(state): State<AppState>) -> Response {
    if state.scheduler.state() == SchedulerState::Stopped {
        return error_response(StatusCode::CONFLICT, SchedulerError::NotRunning);
    }
    if state.scheduler.trigger_speedtest() {
        (
            StatusCode::ACCEPTED,
            Json(SpeedTestTriggerResponse { started: true }),
        )
            .into_response()
    } else {
        error_response(StatusCode::CONFLICT, "speed test already in progress")
    }
}

pub async fn handle_last_traceroute(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.last_traceroute().await)
}

pub async fn handle_traceroute(State(state): State<AppState>) -> Response {
    if state.scheduler.trigger_traceroute() {
        (
            StatusCode::ACCEPTED,
            Json(SpeedTestTriggerResponse { started: true }),
        )
            .into_response()
    } else {
        error_response(StatusCode::CONFLICT, "traceroute disabled or already in progress")
    }
}

// ============================================================================
// API: Reports
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub files: ReportFiles,
    pub report: Report,
}

pub async fn handle_report(State(state): State<AppState>) -> Response {
    let reports = state.reports.clone();
    let log_path = state.log_path.clone();

    let joined = tokio::task::spawn_blocking(move || {
        reports.generate_and_save(&log_path, &TimeRange::all())
    })
    .await;

    match joined {
        Ok(Ok((report, files))) => Json(ReportResponse { files, report }).into_response(),
        Ok(Err(e)) => {
            tracing::error!("Report generation failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
