//! Single-pass aggregation of log records into a report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tdigests::{Centroid, TDigest};

use crate::store::{round2, LogRecord, SpeedTestStatus};

use super::TimeRange;

/// Values buffered before they are folded into the digest.
const DIGEST_CHUNK: usize = 1024;

/// Centroids kept after each merge.
const DIGEST_COMPRESSION: usize = 100;

/// Points kept per chart series.
pub const SERIES_CAPACITY: usize = 600;

/// Summary statistics over a window of the log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub duration_secs: f64,

    pub sample_count: u64,
    pub skipped_rows: u64,
    pub reachable_count: u64,
    pub unreachable_count: u64,
    pub packet_loss_rate: f64,
    pub uptime_percent: f64,
    pub disconnects: u64,
    pub longest_outage_secs: f64,

    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub avg_jitter_ms: Option<f64>,
    pub max_jitter_ms: Option<f64>,

    pub avg_cpu_percent: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub avg_memory_percent: Option<f64>,
    pub max_memory_percent: Option<f64>,
    pub avg_disk_percent: Option<f64>,
    pub max_disk_percent: Option<f64>,

    pub speedtest_count: u64,
    pub speedtest_failures: u64,
    pub avg_download_mbps: Option<f64>,
    pub avg_upload_mbps: Option<f64>,
    pub avg_ping_ms: Option<f64>,
}

/// A time series point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Bounded series that halves its resolution whenever it fills up.
#[derive(Debug, Clone)]
pub struct Series {
    points: Vec<Point>,
    capacity: usize,
    stride: usize,
    seen: usize,
}

impl Series {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: Vec::new(),
            capacity: capacity.max(2),
            stride: 1,
            seen: 0,
        }
    }

    pub fn push(&mut self, time: DateTime<Utc>, value: f64) {
        if self.seen % self.stride == 0 {
            self.points.push(Point { time, value });
            if self.points.len() > self.capacity {
                self.points = self.points.iter().copied().step_by(2).collect();
                self.stride *= 2;
            }
        }
        self.seen += 1;
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }
}

/// Chart data collected alongside the report.
#[derive(Debug, Clone)]
pub struct ReportSeries {
    pub latency: Series,
    pub cpu: Series,
    pub memory: Series,
    pub disk: Series,
    pub download: Series,
    pub upload: Series,
    /// Start of each outage, valued at zero.
    pub disconnects: Series,
}

impl Default for ReportSeries {
    fn default() -> Self {
        Self {
            latency: Series::new(SERIES_CAPACITY),
            cpu: Series::new(SERIES_CAPACITY),
            memory: Series::new(SERIES_CAPACITY),
            disk: Series::new(SERIES_CAPACITY),
            download: Series::new(SERIES_CAPACITY),
            upload: Series::new(SERIES_CAPACITY),
            disconnects: Series::new(SERIES_CAPACITY),
        }
    }
}

/// Streaming percentile estimator.
#[derive(Default)]
struct LatencyDigest {
    pending: Vec<f64>,
    digest: Option<TDigest>,
}

impl LatencyDigest {
    fn add(&mut self, value: f64) {
        self.pending.push(value);
        if self.pending.len() >= DIGEST_CHUNK {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let chunk = TDigest::from_values(std::mem::take(&mut self.pending));
        self.digest = Some(match self.digest.take() {
            None => chunk,
            Some(acc) => merge_digests(&acc, &chunk),
        });
    }

    /// p50, p95 and p99, if any value was added.
    fn quantiles(mut self) -> Option<(f64, f64, f64)> {
        self.flush();
        let digest = self.digest?;
        Some((
            digest.estimate_quantile(0.50),
            digest.estimate_quantile(0.95),
            digest.estimate_quantile(0.99),
        ))
    }
}

fn merge_digests(a: &TDigest, b: &TDigest) -> TDigest {
    let mut centroids: Vec<Centroid> = a
        .centroids()
        .iter()
        .chain(b.centroids().iter())
        .map(|c| Centroid::new(c.mean, c.weight))
        .collect();
    centroids.sort_by(|x, y| x.mean.total_cmp(&y.mean));

    let mut merged = TDigest::from_centroids(centroids);
    merged.compress(DIGEST_COMPRESSION);
    merged
}

/// Running mean and maximum.
#[derive(Debug, Default, Clone, Copy)]
struct Running {
    sum: f64,
    max: Option<f64>,
    count: u64,
}

impl Running {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Accumulates log records one at a time.
pub struct ReportBuilder {
    range: TimeRange,
    skipped_rows: u64,
    sample_count: u64,
    reachable_count: u64,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,

    latency: Running,
    min_latency: Option<f64>,
    digest: LatencyDigest,
    jitter: Running,
    previous_latency: Option<f64>,

    outage_start: Option<DateTime<Utc>>,
    disconnects: u64,
    longest_outage_secs: f64,

    cpu: Running,
    memory: Running,
    disk: Running,

    speedtest_count: u64,
    speedtest_failures: u64,
    download: Running,
    upload: Running,
    ping: Running,

    series: ReportSeries,
}

impl ReportBuilder {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            skipped_rows: 0,
            sample_count: 0,
            reachable_count: 0,
            first: None,
            last: None,
            latency: Running::default(),
            min_latency: None,
            digest: LatencyDigest::default(),
            jitter: Running::default(),
            previous_latency: None,
            outage_start: None,
            disconnects: 0,
            longest_outage_secs: 0.0,
            cpu: Running::default(),
            memory: Running::default(),
            disk: Running::default(),
            speedtest_count: 0,
            speedtest_failures: 0,
            download: Running::default(),
            upload: Running::default(),
            ping: Running::default(),
            series: ReportSeries::default(),
        }
    }

    /// Count rows the log reader could not parse.
    pub fn add_skipped(&mut self, rows: u64) {
        self.skipped_rows += rows;
    }

    /// Feed one record. Records outside the range are ignored.
    pub fn push(&mut self, record: &LogRecord) {
        let ts = record.timestamp;
        if !self.range.contains(ts) {
            return;
        }

        self.sample_count += 1;
        self.first.get_or_insert(ts);
        self.last = Some(ts);

        self.cpu.add(record.cpu_percent as f64);
        self.memory.add(record.memory_percent as f64);
        self.disk.add(record.disk_percent as f64);
        self.series.cpu.push(ts, record.cpu_percent as f64);
        self.series.memory.push(ts, record.memory_percent as f64);
        self.series.disk.push(ts, record.disk_percent as f64);

        match record.latency_ms.filter(|_| record.is_reachable()) {
            Some(latency) => {
                self.reachable_count += 1;
                self.latency.add(latency);
                self.min_latency = Some(self.min_latency.map_or(latency, |m| m.min(latency)));
                self.digest.add(latency);
                self.series.latency.push(ts, latency);

                if let Some(previous) = self.previous_latency {
                    self.jitter.add((latency - previous).abs());
                }
                self.previous_latency = Some(latency);

                if let Some(start) = self.outage_start.take() {
                    self.close_outage(start, ts);
                }
            }
            None => {
                self.previous_latency = None;
                if self.outage_start.is_none() {
                    self.outage_start = Some(ts);
                    self.disconnects += 1;
                    self.series.disconnects.push(ts, 0.0);
                }
            }
        }

        if let Some(status) = record.speedtest_status {
            self.speedtest_count += 1;
            match status {
                SpeedTestStatus::Success => {
                    if let Some(dl) = record.download_mbps {
                        self.download.add(dl);
                        self.series.download.push(ts, dl);
                    }
                    if let Some(ul) = record.upload_mbps {
                        self.upload.add(ul);
                        self.series.upload.push(ts, ul);
                    }
                    if let Some(ping) = record.ping_ms {
                        self.ping.add(ping);
                    }
                }
                SpeedTestStatus::Failure | SpeedTestStatus::Timeout => {
                    self.speedtest_failures += 1;
                }
            }
        }
    }

    fn close_outage(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let secs = (end - start).num_milliseconds() as f64 / 1000.0;
        if secs > self.longest_outage_secs {
            self.longest_outage_secs = secs;
        }
    }

    pub fn finish(mut self) -> (Report, ReportSeries) {
        // A log that ends disconnected closes its outage at the last row.
        if let (Some(start), Some(last)) = (self.outage_start.take(), self.last) {
            self.close_outage(start, last);
        }

        let unreachable_count = self.sample_count - self.reachable_count;
        let (packet_loss_rate, uptime_percent) = if self.sample_count > 0 {
            let n = self.sample_count as f64;
            (
                unreachable_count as f64 / n,
                self.reachable_count as f64 / n * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        let duration_secs = match (self.first, self.last) {
            (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        let (p50, p95, p99) = match self.digest.quantiles() {
            Some((p50, p95, p99)) => (Some(round2(p50)), Some(round2(p95)), Some(round2(p99))),
            None => (None, None, None),
        };

        let report = Report {
            generated_at: Utc::now(),
            range_start: self.range.since,
            range_end: self.range.until,
            first_timestamp: self.first,
            last_timestamp: self.last,
            duration_secs,
            sample_count: self.sample_count,
            skipped_rows: self.skipped_rows,
            reachable_count: self.reachable_count,
            unreachable_count,
            packet_loss_rate,
            uptime_percent,
            disconnects: self.disconnects,
            longest_outage_secs: self.longest_outage_secs,
            avg_latency_ms: self.latency.mean(),
            min_latency_ms: self.min_latency,
            max_latency_ms: self.latency.max,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            avg_jitter_ms: self.jitter.mean(),
            max_jitter_ms: self.jitter.max,
            avg_cpu_percent: self.cpu.mean(),
            max_cpu_percent: self.cpu.max,
            avg_memory_percent: self.memory.mean(),
            max_memory_percent: self.memory.max,
            avg_disk_percent: self.disk.mean(),
            max_disk_percent: self.disk.max,
            speedtest_count: self.speedtest_count,
            speedtest_failures: self.speedtest_failures,
            avg_download_mbps: self.download.mean(),
            avg_upload_mbps: self.upload.mean(),
            avg_ping_ms: self.ping.mean(),
        };

        (report, self.series)
    }
}
