//! Report generation from the CSV log.
//!
//! A report is a pure function of the log rows in a time window. It is
//! rendered twice: as a JSON summary and as a standalone HTML page with
//! inline SVG charts.

pub mod render;
mod summary;

pub use summary::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::{for_each_record, LogError};

/// Report error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read log: {0}")]
    Read(#[from] LogError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inclusive time window; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    /// The whole log.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| ts >= s) && self.until.map_or(true, |u| ts <= u)
    }
}

/// A report and its two renderings.
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub report: Report,
    pub json: String,
    pub html: String,
}

/// Paths of a saved report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportFiles {
    pub html: PathBuf,
    pub json: PathBuf,
}

/// Builds reports from the log and writes them to a directory.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    reports_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new<P: AsRef<Path>>(reports_dir: P) -> Self {
        Self {
            reports_dir: reports_dir.as_ref().to_path_buf(),
        }
    }

    /// Aggregate the log rows inside `range` in one pass.
    ///
    /// A missing log yields an empty report. Malformed rows are counted in
    /// `skipped_rows` and otherwise ignored.
    pub fn generate<P: AsRef<Path>>(
        &self,
        log_path: P,
        range: &TimeRange,
    ) -> Result<RenderedReport, ReportError> {
        let log_path = log_path.as_ref();
        let mut builder = ReportBuilder::new(*range);
        let skipped = for_each_record(log_path, |record| builder.push(&record))?;
        builder.add_skipped(skipped);

        let (report, series) = builder.finish();
        if report.skipped_rows > 0 {
            tracing::warn!(
                "Report: skipped {} malformed rows in {}",
                report.skipped_rows,
                log_path.display()
            );
        }
        tracing::info!(
            "Report: {} samples, uptime {:.2}%",
            report.sample_count,
            report.uptime_percent
        );

        let json = serde_json::to_string_pretty(&report)?;
        let html = render::render_report(&report, &series);

        Ok(RenderedReport { report, json, html })
    }

    /// Write both renderings, named after the generation time.
    pub fn save(&self, rendered: &RenderedReport) -> Result<ReportFiles, ReportError> {
        fs::create_dir_all(&self.reports_dir).map_err(|source| ReportError::Io {
            path: self.reports_dir.clone(),
            source,
        })?;

        let stamp = rendered.report.generated_at.format("%Y-%m-%d_%H-%M-%S").to_string();
        let files = self.unused_names(&stamp);

        write_file(&files.html, &rendered.html)?;
        write_file(&files.json, &rendered.json)?;

        tracing::info!(
            "Report saved to {} and {}",
            files.html.display(),
            files.json.display()
        );
        Ok(files)
    }

    /// File names for `stamp`, suffixed `_1`, `_2`, ... when a report saved
    /// in the same second already took them.
    fn unused_names(&self, stamp: &str) -> ReportFiles {
        let named = |suffix: String| ReportFiles {
            html: self
                .reports_dir
                .join(format!("network_report_{}{}.html", stamp, suffix)),
            json: self
                .reports_dir
                .join(format!("summary_report_{}{}.json", stamp, suffix)),
        };
        let mut files = named(String::new());
        let mut n = 0;
        while files.html.exists() || files.json.exists() {
            n += 1;
            files = named(format!("_{}", n));
        }
        files
    }

    /// Generate over `range` and save.
    pub fn generate_and_save<P: AsRef<Path>>(
        &self,
        log_path: P,
        range: &TimeRange,
    ) -> Result<(Report, ReportFiles), ReportError> {
        let rendered = self.generate(log_path, range)?;
        let files = self.save(&rendered)?;
        Ok((rendered.report, files))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ReportError> {
    fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HEADER: &str = "timestamp,cpu_percent,memory_percent,disk_percent,latency_ms,unreachable,download_mbps,upload_mbps,ping_ms,speedtest_status";

    fn write_log(dir: &Path, rows: &[&str]) -> PathBuf {
        let path = dir.join("network_log.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        path
    }

    #[test]
    fn test_missing_log_is_empty_report() {
        let dir = TempDir::new().unwrap();
        let generator = ReportGenerator::new(dir.path().join("reports"));
        let rendered = generator
            .generate(dir.path().join("absent.csv"), &TimeRange::all())
            .unwrap();

        assert_eq!(rendered.report.sample_count, 0);
        assert!(rendered.report.avg_latency_ms.is_none());
        assert!(rendered.json.contains("\"sample_count\": 0"));
        assert!(rendered.html.contains("No data"));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            dir.path(),
            &[
                "2025-03-01T12:00:00Z,5,40,60,10.0,false,,,,",
                "not a timestamp,5,40,60,10.0,false,,,,",
                "2025-03-01T12:00:02Z,5,40,60,14.0,false,,,,",
                "2025-03-01T12:00:03Z,5,40,60,abc,false,,,,",
                "2025-03-01T12:00:04Z,5,40,60,,true,,,,",
            ],
        );

        let generator = ReportGenerator::new(dir.path().join("reports"));
        let report = generator.generate(&log, &TimeRange::all()).unwrap().report;

        assert_eq!(report.sample_count, 3);
        assert_eq!(report.skipped_rows, 2);
        assert_eq!(report.avg_latency_ms, Some(12.0));
        assert_eq!(report.disconnects, 1);
    }

    #[test]
    fn test_window_excludes_rows() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            dir.path(),
            &[
                "2025-03-01T11:00:00Z,5,40,60,100.0,false,,,,",
                "2025-03-01T12:00:00Z,5,40,60,10.0,false,,,,",
                "2025-03-01T13:00:00Z,5,40,60,100.0,false,,,,",
            ],
        );
        let range = TimeRange::new(
            Some("2025-03-01T11:30:00Z".parse().unwrap()),
            Some("2025-03-01T12:30:00Z".parse().unwrap()),
        );

        let generator = ReportGenerator::new(dir.path());
        let report = generator.generate(&log, &range).unwrap().report;
        assert_eq!(report.sample_count, 1);
        assert_eq!(report.avg_latency_ms, Some(10.0));
        assert_eq!(report.skipped_rows, 0);
    }

    #[test]
    fn test_save_writes_named_files() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            dir.path(),
            &[
                "2025-03-01T12:00:00Z,5,40,60,10.0,false,95.5,20.25,9.0,success",
                "2025-03-01T12:00:02Z,5,40,60,12.0,false,,,,",
            ],
        );
        let generator = ReportGenerator::new(dir.path().join("out/reports"));
        let (report, files) = generator.generate_and_save(&log, &TimeRange::all()).unwrap();

        assert_eq!(report.speedtest_count, 1);
        let html_name = files.html.file_name().unwrap().to_string_lossy().to_string();
        let json_name = files.json.file_name().unwrap().to_string_lossy().to_string();
        assert!(html_name.starts_with("network_report_") && html_name.ends_with(".html"));
        assert!(json_name.starts_with("summary_report_") && json_name.ends_with(".json"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&files.json).unwrap()).unwrap();
        assert_eq!(json["sample_count"], 2);
        assert_eq!(json["avg_download_mbps"], 95.5);

        let html = fs::read_to_string(&files.html).unwrap();
        assert!(html.contains("<svg"));
        assert!(html.contains("95.50 Mbps"));
    }

    #[test]
    fn test_saves_in_the_same_second_keep_both() {
        let dir = TempDir::new().unwrap();
        let log = write_log(dir.path(), &["2025-03-01T12:00:00Z,5,40,60,10.0,false,,,,"]);
        let generator = ReportGenerator::new(dir.path().join("reports"));
        let rendered = generator.generate(&log, &TimeRange::all()).unwrap();

        let first = generator.save(&rendered).unwrap();
        let second = generator.save(&rendered).unwrap();
        let third = generator.save(&rendered).unwrap();

        assert_ne!(first.html, second.html);
        assert_ne!(first.json, second.json);
        assert!(second.html.to_string_lossy().ends_with("_1.html"));
        assert!(third.json.to_string_lossy().ends_with("_2.json"));
        for files in [&first, &second, &third] {
            assert!(files.html.exists());
            assert!(files.json.exists());
        }
    }

    #[test]
    fn test_time_range_contains() {
        let t: DateTime<Utc> = "2025-03-01T12:00:00Z".parse().unwrap();
        assert!(TimeRange::all().contains(t));
        assert!(TimeRange::new(Some(t), Some(t)).contains(t));
        assert!(!TimeRange::new(Some(t + chrono::Duration::seconds(1)), None).contains(t));
    }
}
