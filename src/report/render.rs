//! HTML rendering with inline SVG charts.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use super::{Point, Report, ReportSeries};

const REPORT_TEMPLATE: &str = include_str!("templates/report.html");

const CHART_WIDTH: f64 = 860.0;
const CHART_HEIGHT: f64 = 220.0;
const MARGIN: f64 = 40.0;

/// One line on a chart.
pub struct Line<'a> {
    pub label: &'a str,
    pub color: &'a str,
    pub points: &'a [Point],
}

/// Render a line chart as an inline SVG element.
///
/// Points are placed by time on the x axis; the y axis starts at zero.
/// `markers` are drawn as vertical red lines, e.g. disconnects.
pub fn svg_line_chart(title: &str, unit: &str, lines: &[Line<'_>], markers: &[Point]) -> String {
    let all: Vec<&Point> = lines.iter().flat_map(|l| l.points.iter()).collect();
    if all.is_empty() {
        return format!(
            "<div class=\"chart\"><h3>{}</h3><p class=\"empty\">No data</p></div>",
            escape(title)
        );
    }

    let times = || all.iter().map(|p| p.time).chain(markers.iter().map(|p| p.time));
    let (t_min, t_max) = match (times().min(), times().max()) {
        (Some(a), Some(b)) => (a, b),
        _ => return String::new(),
    };
    let span_ms = ((t_max - t_min).num_milliseconds() as f64).max(1.0);
    let y_max = all.iter().map(|p| p.value).fold(0.0_f64, f64::max).max(1.0) * 1.1;

    let plot_w = CHART_WIDTH - 2.0 * MARGIN;
    let plot_h = CHART_HEIGHT - 2.0 * MARGIN;
    let x = |t: DateTime<Utc>| MARGIN + (t - t_min).num_milliseconds() as f64 / span_ms * plot_w;
    let y = |v: f64| CHART_HEIGHT - MARGIN - v / y_max * plot_h;

    let mut svg = String::new();
    let _ = write!(
        svg,
        "<div class=\"chart\"><h3>{}</h3><svg viewBox=\"0 0 {w} {h}\" width=\"100%\" role=\"img\">",
        escape(title),
        w = CHART_WIDTH,
        h = CHART_HEIGHT
    );

    // Axes and y labels.
    let _ = write!(
        svg,
        "<line class=\"axis\" x1=\"{m}\" y1=\"{b}\" x2=\"{r}\" y2=\"{b}\"/><line class=\"axis\" x1=\"{m}\" y1=\"{m}\" x2=\"{m}\" y2=\"{b}\"/>",
        m = MARGIN,
        b = CHART_HEIGHT - MARGIN,
        r = CHART_WIDTH - MARGIN
    );
    for frac in [0.0, 0.5, 1.0] {
        let v = y_max * frac;
        let _ = write!(
            svg,
            "<text class=\"tick\" x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\">{:.0}{}</text>",
            MARGIN - 4.0,
            y(v) + 4.0,
            v,
            escape(unit)
        );
    }
    let _ = write!(
        svg,
        "<text class=\"tick\" x=\"{m}\" y=\"{y}\">{}</text><text class=\"tick\" x=\"{r}\" y=\"{y}\" text-anchor=\"end\">{}</text>",
        t_min.format("%Y-%m-%d %H:%M:%S"),
        t_max.format("%Y-%m-%d %H:%M:%S"),
        m = MARGIN,
        r = CHART_WIDTH - MARGIN,
        y = CHART_HEIGHT - MARGIN + 16.0
    );

    for marker in markers {
        let mx = x(marker.time);
        let _ = write!(
            svg,
            "<line class=\"marker\" x1=\"{mx:.1}\" y1=\"{top}\" x2=\"{mx:.1}\" y2=\"{b}\"/>",
            top = MARGIN,
            b = CHART_HEIGHT - MARGIN
        );
    }

    for (i, line) in lines.iter().enumerate() {
        if line.points.is_empty() {
            continue;
        }
        let coords: Vec<String> = line
            .points
            .iter()
            .map(|p| format!("{:.1},{:.1}", x(p.time), y(p.value)))
            .collect();
        let _ = write!(
            svg,
            "<polyline fill=\"none\" stroke=\"{}\" stroke-width=\"1.5\" points=\"{}\"/>",
            escape(line.color),
            coords.join(" ")
        );
        if line.points.len() == 1 {
            let _ = write!(
                svg,
                "<circle cx=\"{:.1}\" cy=\"{:.1}\" r=\"3\" fill=\"{}\"/>",
                x(line.points[0].time),
                y(line.points[0].value),
                escape(line.color)
            );
        }
        let _ = write!(
            svg,
            "<text class=\"legend\" x=\"{:.1}\" y=\"{:.1}\" fill=\"{}\">{}</text>",
            MARGIN + 8.0 + i as f64 * 120.0,
            MARGIN - 10.0,
            escape(line.color),
            escape(line.label)
        );
    }

    svg.push_str("</svg></div>");
    svg
}

/// Render the full HTML report page.
pub fn render_report(report: &Report, series: &ReportSeries) -> String {
    let latency = svg_line_chart(
        "Latency",
        " ms",
        &[Line {
            label: "latency",
            color: "#2b7bb9",
            points: series.latency.points(),
        }],
        series.disconnects.points(),
    );
    let system = svg_line_chart(
        "System utilisation",
        "%",
        &[
            Line {
                label: "cpu",
                color: "#d9534f",
                points: series.cpu.points(),
            },
            Line {
                label: "memory",
                color: "#5cb85c",
                points: series.memory.points(),
            },
            Line {
                label: "disk",
                color: "#f0ad4e",
                points: series.disk.points(),
            },
        ],
        &[],
    );
    let speed = svg_line_chart(
        "Speed tests",
        "",
        &[
            Line {
                label: "download Mbps",
                color: "#2b7bb9",
                points: series.download.points(),
            },
            Line {
                label: "upload Mbps",
                color: "#9b59b6",
                points: series.upload.points(),
            },
        ],
        &[],
    );

    REPORT_TEMPLATE
        .replace("{{generated_at}}", &report.generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .replace("{{range}}", &escape(&describe_range(report)))
        .replace("{{summary_rows}}", &summary_rows(report))
        .replace("{{latency_chart}}", &latency)
        .replace("{{system_chart}}", &system)
        .replace("{{speed_chart}}", &speed)
}

fn describe_range(report: &Report) -> String {
    match (report.first_timestamp, report.last_timestamp) {
        (Some(first), Some(last)) => format!(
            "{} to {}",
            first.format("%Y-%m-%d %H:%M:%S"),
            last.format("%Y-%m-%d %H:%M:%S")
        ),
        _ => "No data".to_string(),
    }
}

fn summary_rows(report: &Report) -> String {
    let rows = [
        ("Samples", report.sample_count.to_string()),
        ("Skipped rows", report.skipped_rows.to_string()),
        ("Total duration", format_duration(report.duration_secs)),
        ("Uptime", format!("{:.2}%", report.uptime_percent)),
        ("Packet loss", format!("{:.2}%", report.packet_loss_rate * 100.0)),
        ("Disconnects", report.disconnects.to_string()),
        ("Longest outage", format_duration(report.longest_outage_secs)),
        ("Average latency", opt(report.avg_latency_ms, "ms")),
        ("Min / max latency", format!("{} / {}", opt(report.min_latency_ms, "ms"), opt(report.max_latency_ms, "ms"))),
        ("p50 / p95 / p99 latency", format!(
            "{} / {} / {}",
            opt(report.p50_latency_ms, "ms"),
            opt(report.p95_latency_ms, "ms"),
            opt(report.p99_latency_ms, "ms")
        )),
        ("Average jitter", opt(report.avg_jitter_ms, "ms")),
        ("Maximum jitter", opt(report.max_jitter_ms, "ms")),
        ("CPU avg / max", format!("{} / {}", opt(report.avg_cpu_percent, "%"), opt(report.max_cpu_percent, "%"))),
        ("Memory avg / max", format!("{} / {}", opt(report.avg_memory_percent, "%"), opt(report.max_memory_percent, "%"))),
        ("Disk avg / max", format!("{} / {}", opt(report.avg_disk_percent, "%"), opt(report.max_disk_percent, "%"))),
        ("Speed tests", format!("{} ({} failed)", report.speedtest_count, report.speedtest_failures)),
        ("Average download", opt(report.avg_download_mbps, "Mbps")),
        ("Average upload", opt(report.avg_upload_mbps, "Mbps")),
        ("Average speed-test ping", opt(report.avg_ping_ms, "ms")),
    ];

    rows.iter()
        .map(|(k, v)| format!("<tr><th>{}</th><td>{}</td></tr>", k, escape(v)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn opt(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) if unit == "%" => format!("{:.2}%", v),
        Some(v) => format!("{:.2} {}", v, unit),
        None => "N/A".to_string(),
    }
}

/// `1h 02m 03s` style duration.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, total % 3600 / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Minimal HTML escaping for text and attribute values.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
