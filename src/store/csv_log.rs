//! Append-only CSV log.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::models::LogRecord;

/// Log error types.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Appends records to the CSV log.
///
/// The file is reopened in append mode for every record, so a log that is
/// rotated or removed underneath the writer gets a fresh header.
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    last_timestamp: Option<DateTime<Utc>>,
}

impl LogWriter {
    /// Create a writer for `path`, recovering the last timestamp of an
    /// existing log so timestamps keep increasing across restarts.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut last = None;
        let last_timestamp = match for_each_record(&path, |r| last = Some(r.timestamp)) {
            Ok(skipped) => {
                if skipped > 0 {
                    tracing::warn!("LogWriter: {} malformed rows in {}", skipped, path.display());
                }
                last
            }
            Err(e) => {
                tracing::warn!("LogWriter: could not scan existing log: {}", e);
                None
            }
        };
        Self { path, last_timestamp }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, writing the header first if the file is new or
    /// empty.
    ///
    /// A record stamped earlier than the previous one (clock stepped back) is
    /// written with the previous timestamp.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let io_err = |source| LogError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let needs_header = file.metadata().map_err(io_err)?.len() == 0;

        let mut record = record.clone();
        if let Some(last) = self.last_timestamp {
            if record.timestamp < last {
                tracing::debug!(
                    "LogWriter: clamping timestamp {} to {}",
                    record.timestamp,
                    last
                );
                record.timestamp = last;
            }
        }

        let csv_err = |source| LogError::Csv {
            path: self.path.clone(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(&record).map_err(csv_err)?;
        writer.flush().map_err(io_err)?;

        self.last_timestamp = Some(record.timestamp);
        Ok(())
    }
}

/// Records read back from a log, plus the number of rows that could not be
/// parsed.
#[derive(Debug, Default)]
pub struct LogScan {
    pub records: Vec<LogRecord>,
    pub skipped: u64,
}

/// Visit every parseable row of the log in file order.
///
/// Returns the number of skipped (malformed) rows. A missing file is an empty
/// log.
pub fn for_each_record<P, F>(path: P, mut visit: F) -> Result<u64, LogError>
where
    P: AsRef<Path>,
    F: FnMut(LogRecord),
{
    let path = path.as_ref();
    let mut reader = match csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
    {
        Ok(r) => r,
        Err(e) => {
            if let csv::ErrorKind::Io(io) = e.kind() {
                if io.kind() == io::ErrorKind::NotFound {
                    return Ok(0);
                }
            }
            return Err(LogError::Csv {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let mut skipped = 0;
    for row in reader.deserialize::<LogRecord>() {
        match row {
            Ok(record) => visit(record),
            Err(e) => {
                if let csv::ErrorKind::Io(_) = e.kind() {
                    return Err(LogError::Csv {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                tracing::debug!("Skipping malformed log row: {}", e);
                skipped += 1;
            }
        }
    }

    Ok(skipped)
}

/// Read the whole log into memory.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<LogScan, LogError> {
    let mut records = Vec::new();
    let skipped = for_each_record(path, |r| records.push(r))?;
    Ok(LogScan { records, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{HostMetrics, Sample, SpeedTestResult, CSV_HEADER};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn record_at(ts: DateTime<Utc>, latency: Option<f64>) -> LogRecord {
        let host = HostMetrics {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
        };
        LogRecord::new(&Sample::new(ts, host, latency), None)
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        let now = Utc::now();

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(10.0))).unwrap();
        writer.append(&record_at(now, None)).unwrap();

        // A second writer on the same file must not repeat the header.
        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(11.0))).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert_eq!(contents.matches("timestamp").count(), 1);
    }

    #[test]
    fn test_header_written_for_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(&path, "").unwrap();

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(Utc::now(), Some(5.0))).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("timestamp,cpu_percent"));
    }

    #[test]
    fn test_unreachable_row_has_empty_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(Utc::now(), None)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let row = contents.lines().nth(1).unwrap();
        assert!(row.ends_with(",10.0,20.0,30.0,,true,,,,"), "row was {}", row);
    }

    #[test]
    fn test_roundtrip_with_speed_test() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("log.csv");
        let now = Utc::now();
        let host = HostMetrics::default();
        let sample = Sample::new(now, host, Some(9.5));
        let speed = SpeedTestResult::success(now, 93.456, 11.5, Some(14.0));

        let mut writer = LogWriter::open(&path);
        writer.append(&LogRecord::new(&sample, Some(&speed))).unwrap();

        let scan = read_log(&path).unwrap();
        assert_eq!(scan.skipped, 0);
        assert_eq!(scan.records.len(), 1);
        let r = &scan.records[0];
        assert_eq!(r.download_mbps, Some(93.46));
        assert_eq!(r.upload_mbps, Some(11.5));
        assert_eq!(r.speedtest_status, Some(crate::store::SpeedTestStatus::Success));
        assert_eq!(r.timestamp, now);
    }

    #[test]
    fn test_timestamps_clamped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        let now = Utc::now();

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(1.0))).unwrap();
        writer
            .append(&record_at(now - ChronoDuration::seconds(30), Some(2.0)))
            .unwrap();

        // The clamp survives a restart too.
        let mut writer = LogWriter::open(&path);
        writer
            .append(&record_at(now - ChronoDuration::seconds(60), Some(3.0)))
            .unwrap();

        let scan = read_log(&path).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert!(scan.records.iter().all(|r| r.timestamp == now));
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        let now = Utc::now();

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(1.0))).unwrap();
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("not-a-date,1,2,3,4,false,,,,\n");
        contents.push_str("garbage\n");
        fs::write(&path, contents).unwrap();
        writer.append(&record_at(now, Some(2.0))).unwrap();

        let scan = read_log(&path).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.skipped, 2);
    }

    #[test]
    fn test_reopen_resumes_from_last_valid_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(10);

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(1.0))).unwrap();
        writer.append(&record_at(later, Some(2.0))).unwrap();
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("garbage\n");
        fs::write(&path, contents).unwrap();

        let mut writer = LogWriter::open(&path);
        writer.append(&record_at(now, Some(3.0))).unwrap();

        let scan = read_log(&path).unwrap();
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.records.last().unwrap().timestamp, later);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let scan = read_log(dir.path().join("absent.csv")).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.skipped, 0);
    }

    #[test]
    fn test_unwritable_path_reports_error() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for appending.
        let mut writer = LogWriter::open(dir.path());
        let result = writer.append(&record_at(Utc::now(), Some(1.0)));
        assert!(matches!(result, Err(LogError::Io { .. })));
    }
}
