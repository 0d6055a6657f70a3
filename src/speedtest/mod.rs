//! Speed tests through an external executable.
//!
//! Only one run may be in flight; a trigger that finds the slot taken is
//! dropped rather than queued.

mod parse;

pub use parse::*;

use chrono::Utc;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::store::SpeedTestResult;

/// Executables looked up on `PATH` when none is configured.
const KNOWN_EXECUTABLES: [&str; 2] = ["speedtest", "speedtest-cli"];

/// Reasons a run did not produce a measurement.
///
/// These never escape the runner; they become the error text of a
/// failed `SpeedTestResult`.
#[derive(Error, Debug)]
pub enum SpeedTestError {
    #[error("no speed-test executable found (tried {0})")]
    NotFound(String),
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("speed test exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("could not parse speed-test output: {0}")]
    Parse(String),
}

/// How to invoke the speed-test executable.
#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    /// Executable path or name; `None` searches `PATH`.
    pub command: Option<String>,
    /// Arguments; `None` picks defaults for the detected tool.
    pub args: Option<Vec<String>>,
    pub timeout: Duration,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            timeout: Duration::from_secs(90),
        }
    }
}

/// A claim on the runner's single slot, held until the run it starts ends.
#[derive(Debug)]
pub struct SpeedTestPermit(OwnedSemaphorePermit);

/// Runs speed tests one at a time.
#[derive(Debug, Clone)]
pub struct SpeedTestRunner {
    config: SpeedTestConfig,
    slot: Arc<Semaphore>,
}

impl SpeedTestRunner {
    pub fn new(config: SpeedTestConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether a run currently holds the slot.
    pub fn is_running(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Run a speed test unless one is already in flight.
    ///
    /// Returns `None` when the trigger was dropped because of a run in
    /// progress.
    pub async fn try_run(&self) -> Option<SpeedTestResult> {
        match self.try_reserve() {
            Some(permit) => Some(self.run_reserved(permit).await),
            None => {
                tracing::warn!("Skipping speed test: previous run still in progress");
                None
            }
        }
    }

    /// Take the slot now so the run can start later, e.g. in a spawned task.
    pub fn try_reserve(&self) -> Option<SpeedTestPermit> {
        self.slot.clone().try_acquire_owned().ok().map(SpeedTestPermit)
    }

    /// Run with a slot taken by `try_reserve`; it is released on return.
    pub async fn run_reserved(&self, permit: SpeedTestPermit) -> SpeedTestResult {
        let result = self.run_exclusive().await;
        drop(permit);
        result
    }

    async fn run_exclusive(&self) -> SpeedTestResult {
        let started = Utc::now();

        let (program, args) = match self.resolve() {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Speed test failed: {}", e);
                return SpeedTestResult::failure(started, e.to_string());
            }
        };

        tracing::info!("Running speed test: {} {}", program.display(), args.join(" "));

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.config.timeout, child).await {
            Err(_) => {
                tracing::warn!("Speed test timed out after {:?}", self.config.timeout);
                return SpeedTestResult::timeout(
                    started,
                    format!("timed out after {:?}", self.config.timeout),
                );
            }
            Ok(Err(e)) => {
                let e = SpeedTestError::Spawn(program.display().to_string(), e);
                tracing::warn!("Speed test failed: {}", e);
                return SpeedTestResult::failure(started, e.to_string());
            }
            Ok(Ok(output)) => output,
        };

        let finished = Utc::now();
        let outcome = if output.status.success() {
            parse_output(&String::from_utf8_lossy(&output.stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SpeedTestError::Exit {
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(200).collect(),
            })
        };

        match outcome {
            Ok(m) => {
                tracing::info!(
                    "Speed test: DL {:.2} Mbps / UL {:.2} Mbps / ping {}",
                    m.download_mbps,
                    m.upload_mbps,
                    m.ping_ms.map(|p| format!("{:.2} ms", p)).unwrap_or_else(|| "n/a".to_string())
                );
                SpeedTestResult::success(finished, m.download_mbps, m.upload_mbps, m.ping_ms)
            }
            Err(e) => {
                tracing::warn!("Speed test failed: {}", e);
                SpeedTestResult::failure(finished, e.to_string())
            }
        }
    }

    /// Resolve the executable and its arguments.
    fn resolve(&self) -> Result<(PathBuf, Vec<String>), SpeedTestError> {
        let program = match &self.config.command {
            Some(cmd) => PathBuf::from(cmd),
            None => KNOWN_EXECUTABLES
                .iter()
                .find_map(|name| find_on_path(name))
                .ok_or_else(|| SpeedTestError::NotFound(KNOWN_EXECUTABLES.join(", ")))?,
        };

        let args = self
            .config
            .args
            .clone()
            .unwrap_or_else(|| default_args(&program));

        Ok((program, args))
    }
}

/// JSON output flags for the known tools.
fn default_args(program: &Path) -> Vec<String> {
    let stem = program
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    let flags: &[&str] = match stem.as_str() {
        "speedtest" => &["--format=json", "--accept-license", "--accept-gdpr"],
        "speedtest-cli" | "speedtest_cli" => &["--json"],
        _ => &[],
    };
    flags.iter().map(|s| s.to_string()).collect()
}

/// Find an executable in the directories of `PATH`.
fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{}.exe", name));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
