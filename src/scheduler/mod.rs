//! Scheduler driving the monitoring and speed-test ticks.

mod connection;

pub use connection::*;

use crate::chart::{ChartBuffer, ChartReader};
use crate::config::MonitorConfig;
use crate::metrics::{MetricSampler, Sampler};
use crate::speedtest::SpeedTestRunner;
use crate::store::{LogRecord, LogWriter, SpeedTestResult};
use crate::traceroute::{TracerouteConfig, TracerouteReport, TracerouteRunner};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

/// Scheduler error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("scheduler is not paused")]
    NotPaused,
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Disconnected { at: DateTime<Utc> },
    Reconnected { at: DateTime<Utc>, outage_secs: f64 },
    SpeedTestCompleted(SpeedTestResult),
    TracerouteCompleted(TracerouteReport),
    LogWriteFailed { error: String },
}

/// Intervals and buffer sizes the scheduler is built with.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub monitoring_interval: Duration,
    /// `None` disables periodic speed tests.
    pub speedtest_interval: Option<Duration>,
    pub chart_capacity: usize,
    /// Traceroute run on every disconnect; `None` disables it.
    pub traceroute: Option<TracerouteConfig>,
}

impl From<&MonitorConfig> for SchedulerConfig {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            monitoring_interval: cfg.monitoring_interval,
            speedtest_interval: cfg.speedtest_interval,
            chart_capacity: cfg.chart_capacity,
            traceroute: cfg.traceroute_config(),
        }
    }
}

/// State shared between the scheduler handle and its tick tasks.
struct Shared {
    sampler: Mutex<Box<dyn Sampler>>,
    writer: Mutex<LogWriter>,
    runner: SpeedTestRunner,
    tracer: Option<TracerouteRunner>,
    chart: ChartBuffer,
    /// Finished speed tests waiting for a monitoring tick, oldest first.
    pending_speed: Mutex<VecDeque<SpeedTestResult>>,
    /// Bumped by every stop; results from an earlier run are discarded.
    epoch: AtomicU64,
    last_traceroute: Mutex<Option<TracerouteReport>>,
    connection: Mutex<ConnectionTracker>,
    connected: AtomicBool,
    state: watch::Sender<SchedulerState>,
    events: broadcast::Sender<MonitorEvent>,
}

/// Tasks belonging to one Running/Paused period.
struct Run {
    stop_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Run {
    /// Signal both loops and wait for a tick in progress to finish.
    async fn cancel(self) {
        let _ = self.stop_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

/// The scheduler that orchestrates sampling, speed tests and logging.
pub struct Scheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl Scheduler {
    /// Create a scheduler from its parts.
    pub fn new(
        config: SchedulerConfig,
        sampler: Box<dyn Sampler>,
        runner: SpeedTestRunner,
        writer: LogWriter,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        let (events, _) = broadcast::channel(64);

        let shared = Shared {
            sampler: Mutex::new(sampler),
            writer: Mutex::new(writer),
            runner,
            tracer: config.traceroute.clone().map(TracerouteRunner::new),
            chart: ChartBuffer::new(config.chart_capacity),
            pending_speed: Mutex::new(VecDeque::new()),
            epoch: AtomicU64::new(0),
            last_traceroute: Mutex::new(None),
            connection: Mutex::new(ConnectionTracker::default()),
            connected: AtomicBool::new(true),
            state,
            events,
        };

        Self {
            config,
            shared: Arc::new(shared),
            run: Mutex::new(None),
        }
    }

    /// Build the production sampler, runner and log writer from `cfg`.
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        let sampler = MetricSampler::new(cfg.probe_configs()).with_health_checks(cfg.health_checks());
        let runner = SpeedTestRunner::new(cfg.speedtest.clone());
        let writer = LogWriter::open(&cfg.log_path);
        Self::new(SchedulerConfig::from(cfg), Box::new(sampler), runner, writer)
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    pub fn chart(&self) -> ChartReader {
        self.shared.chart.reader()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_speedtest_running(&self) -> bool {
        self.shared.runner.is_running()
    }

    pub fn is_traceroute_running(&self) -> bool {
        self.shared.tracer.as_ref().is_some_and(|t| t.is_running())
    }

    pub async fn last_traceroute(&self) -> Option<TracerouteReport> {
        self.shared.last_traceroute.lock().await.clone()
    }

    /// Start with the intervals the scheduler was configured with.
    pub async fn start_configured(&self) -> Result<(), SchedulerError> {
        self.start(self.config.monitoring_interval, self.config.speedtest_interval)
            .await
    }

    /// Begin the monitoring and speed-test triggers.
    ///
    /// Starting from Paused replaces the running triggers with new ones.
    /// Starting from Stopped begins a fresh run: empty charts, no pending
    /// results and a connected baseline.
    pub async fn start(
        &self,
        monitoring_interval: Duration,
        speedtest_interval: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        if monitoring_interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(
                "monitoring interval must be positive".to_string(),
            ));
        }
        if speedtest_interval.is_some_and(|d| d.is_zero()) {
            return Err(SchedulerError::InvalidInterval(
                "speed-test interval must be positive".to_string(),
            ));
        }

        let mut run = self.run.lock().await;
        match self.state() {
            SchedulerState::Running => return Err(SchedulerError::AlreadyRunning),
            SchedulerState::Paused => {
                if let Some(old) = run.take() {
                    old.cancel().await;
                }
            }
            SchedulerState::Stopped => self.shared.reset().await,
        }

        tracing::info!(
            "Starting scheduler: logging to {}, monitoring every {:?}, speed test {}",
            self.shared.writer.lock().await.path().display(),
            monitoring_interval,
            speedtest_interval
                .map(|d| format!("every {:?}", d))
                .unwrap_or_else(|| "disabled".to_string())
        );

        let (stop_tx, _) = broadcast::channel(1);
        self.shared.state.send_replace(SchedulerState::Running);

        let mut handles = vec![tokio::spawn(run_monitoring_loop(
            self.shared.clone(),
            monitoring_interval,
            stop_tx.subscribe(),
        ))];
        if let Some(interval) = speedtest_interval {
            handles.push(tokio::spawn(run_speedtest_loop(
                self.shared.clone(),
                interval,
                stop_tx.subscribe(),
            )));
        }

        *run = Some(Run { stop_tx, handles });
        Ok(())
    }

    /// Cancel both triggers.
    ///
    /// A tick already in progress completes. Results that finished before
    /// the stop but were not logged yet get one final row each. An in-flight
    /// speed test keeps running; its result is discarded when it arrives.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut run = self.run.lock().await;
        if self.state() == SchedulerState::Stopped {
            return Err(SchedulerError::NotRunning);
        }

        {
            // Under the pending lock so a delivery sees either the old epoch
            // and gets flushed below, or the new one and is discarded.
            let _pending = self.shared.pending_speed.lock().await;
            self.shared.state.send_replace(SchedulerState::Stopped);
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(run) = run.take() {
            run.cancel().await;
        }

        let flushed = self.shared.flush_pending().await;
        if flushed > 0 {
            tracing::info!("Logged {} pending speed test result(s) at stop", flushed);
        }

        if self.shared.runner.is_running() {
            tracing::info!("Scheduler stopped; in-flight speed test will be discarded");
        } else {
            tracing::info!("Scheduler stopped");
        }
        Ok(())
    }

    /// Suspend the monitoring trigger. Speed tests are unaffected.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        let _run = self.run.lock().await;
        match self.state() {
            SchedulerState::Running => {
                self.shared.state.send_replace(SchedulerState::Paused);
                tracing::info!("Scheduler paused");
                Ok(())
            }
            _ => Err(SchedulerError::NotRunning),
        }
    }

    /// Resume the monitoring trigger after `pause`.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        let _run = self.run.lock().await;
        match self.state() {
            SchedulerState::Paused => {
                self.shared.state.send_replace(SchedulerState::Running);
                tracing::info!("Scheduler resumed");
                Ok(())
            }
            SchedulerState::Stopped => Err(SchedulerError::NotRunning),
            SchedulerState::Running => Err(SchedulerError::NotPaused),
        }
    }

    /// Run a speed test now, outside the periodic trigger.
    ///
    /// Returns false when the scheduler is stopped or a run is in flight.
    pub fn trigger_speedtest(&self) -> bool {
        if self.state() == SchedulerState::Stopped {
            return false;
        }
        self.shared.spawn_speedtest(true)
    }

    /// Trace the route to the first target now.
    ///
    /// Returns false when traceroute is disabled or one is in flight.
    pub fn trigger_traceroute(&self) -> bool {
        self.shared.spawn_traceroute()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            let _ = run.stop_tx.send(());
        }
    }
}

impl Shared {
    fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Forget everything carried over from a previous run.
    async fn reset(&self) {
        self.chart.clear().await;
        self.pending_speed.lock().await.clear();
        *self.connection.lock().await = ConnectionTracker::default();
        self.connected.store(true, Ordering::Relaxed);
    }

    /// One monitoring tick: sample, log, chart.
    async fn monitoring_tick(self: &Arc<Self>) {
        let sample = self.sampler.lock().await.sample().await;
        let speed = self.pending_speed.lock().await.pop_front();

        let record = LogRecord::new(&sample, speed.as_ref());
        let appended = self.writer.lock().await.append(&record);
        if let Err(e) = appended {
            tracing::warn!("Failed to append log record: {}", e);
            let _ = self.events.send(MonitorEvent::LogWriteFailed {
                error: e.to_string(),
            });
        }

        let transition = {
            let mut tracker = self.connection.lock().await;
            let transition = tracker.observe(sample.timestamp, sample.unreachable);
            self.connected.store(tracker.is_connected(), Ordering::Relaxed);
            transition
        };

        match transition {
            Some(Transition::Disconnected { at }) => {
                tracing::warn!("DISCONNECTED: no target reachable");
                let _ = self.events.send(MonitorEvent::Disconnected { at });
                self.spawn_traceroute();
            }
            Some(Transition::Reconnected { at, outage }) => {
                tracing::info!("Reconnected after {:.2} seconds", outage.as_secs_f64());
                let _ = self.events.send(MonitorEvent::Reconnected {
                    at,
                    outage_secs: outage.as_secs_f64(),
                });
            }
            None => {}
        }

        match sample.latency_ms {
            Some(ms) => tracing::debug!(
                "Sample: latency {:.2} ms, cpu {:.1}%, mem {:.1}%, disk {:.1}%",
                ms,
                sample.cpu_percent,
                sample.memory_percent,
                sample.disk_percent
            ),
            None => tracing::debug!("Sample: unreachable"),
        }

        self.chart.push_sample(sample).await;
        if let Some(speed) = speed {
            self.chart.push_speed_test(speed).await;
        }
    }

    /// Log every parked result with a final sample each.
    async fn flush_pending(self: &Arc<Self>) -> usize {
        let mut flushed = 0;
        while !self.pending_speed.lock().await.is_empty() {
            self.monitoring_tick().await;
            flushed += 1;
        }
        flushed
    }

    /// Spawn a speed test unless one is in flight.
    ///
    /// Periodic triggers are also skipped while disconnected.
    fn spawn_speedtest(self: &Arc<Self>, manual: bool) -> bool {
        if !manual && !self.connected.load(Ordering::Relaxed) {
            tracing::debug!("Speed test not started: disconnected");
            return false;
        }
        let Some(permit) = self.runner.try_reserve() else {
            tracing::info!("Speed test not started: previous run still in progress");
            return false;
        };

        let shared = self.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let result = shared.runner.run_reserved(permit).await;
            shared.deliver_speed_result(result, epoch).await;
        });
        true
    }

    /// Park a finished result for the next monitoring tick.
    async fn deliver_speed_result(&self, result: SpeedTestResult, epoch: u64) {
        let mut pending = self.pending_speed.lock().await;
        if self.state() == SchedulerState::Stopped || self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::info!(
                "Discarding speed test result ({}) completed after stop",
                result.status
            );
            return;
        }

        let _ = self.events.send(MonitorEvent::SpeedTestCompleted(result.clone()));
        pending.push_back(result);
        if pending.len() > 1 {
            tracing::info!("{} speed test results waiting to be logged", pending.len());
        }
    }

    fn spawn_traceroute(self: &Arc<Self>) -> bool {
        let Some(tracer) = &self.tracer else {
            return false;
        };
        let shared = self.clone();
        tracer.spawn(move |report| async move {
            let _ = shared.events.send(MonitorEvent::TracerouteCompleted(report.clone()));
            *shared.last_traceroute.lock().await = Some(report);
        })
    }
}

/// Run the monitoring loop until stopped.
async fn run_monitoring_loop(
    shared: Arc<Shared>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                if shared.state() == SchedulerState::Paused {
                    continue;
                }
                shared.monitoring_tick().await;
            }
        }
    }
}

/// Run the speed-test loop until stopped.
async fn run_speedtest_loop(
    shared: Arc<Shared>,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                shared.spawn_speedtest(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ReportGenerator, TimeRange};
    use crate::speedtest::SpeedTestConfig;
    use crate::store::{read_log, HostMetrics, Sample, SpeedTestStatus};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    /// Replays a fixed latency script, then repeats the last entry.
    struct ScriptedSampler {
        script: VecDeque<Option<f64>>,
        last: Option<f64>,
    }

    impl ScriptedSampler {
        fn boxed(script: &[Option<f64>]) -> Box<dyn Sampler> {
            Box::new(Self {
                script: script.iter().copied().collect(),
                last: script.last().copied().flatten(),
            })
        }
    }

    #[async_trait]
    impl Sampler for ScriptedSampler {
        async fn sample(&mut self) -> Sample {
            let latency = self.script.pop_front().unwrap_or(self.last);
            let host = HostMetrics {
                cpu_percent: 5.0,
                memory_percent: 40.0,
                disk_percent: 60.0,
            };
            Sample::new(Utc::now(), host, latency)
        }
    }

    fn config(interval: Duration) -> SchedulerConfig {
        SchedulerConfig {
            monitoring_interval: interval,
            speedtest_interval: None,
            chart_capacity: 100,
            traceroute: None,
        }
    }

    #[cfg(unix)]
    fn shell_runner(script: &str) -> SpeedTestRunner {
        SpeedTestRunner::new(SpeedTestConfig {
            command: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), script.to_string()]),
            timeout: Duration::from_secs(10),
        })
    }

    fn drain(events: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn speed_results(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::SpeedTestCompleted(_)))
            .count()
    }

    fn idle_runner() -> SpeedTestRunner {
        SpeedTestRunner::new(SpeedTestConfig {
            command: Some("/nonexistent/speedtest".to_string()),
            args: Some(vec![]),
            timeout: Duration::from_secs(1),
        })
    }

    fn scheduler(path: &Path, script: &[Option<f64>]) -> Scheduler {
        Scheduler::new(
            config(Duration::from_secs(1)),
            ScriptedSampler::boxed(script),
            idle_runner(),
            LogWriter::open(path),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_row_per_tick() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let latencies = [Some(10.0), Some(12.0), Some(9.0), Some(11.0), Some(10.0)];
        let scheduler = scheduler(&log, &latencies);

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        scheduler.stop().await.unwrap();

        let scan = read_log(&log).unwrap();
        assert_eq!(scan.records.len(), 5);
        assert!(scan
            .records
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(scheduler.chart().samples().await.len(), 5);

        let generator = ReportGenerator::new(dir.path().join("reports"));
        let rendered = generator.generate(&log, &TimeRange::all()).unwrap();
        let report = rendered.report;
        assert_eq!(report.sample_count, 5);
        assert!((report.avg_latency_ms.unwrap() - 10.4).abs() < 1e-9);
        assert_eq!(report.uptime_percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_stop() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let scheduler = scheduler(&log, &[Some(10.0)]);

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await.unwrap();
        let rows = read_log(&log).unwrap().records.len();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(read_log(&log).unwrap().records.len(), rows);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir.path().join("log.csv"), &[Some(1.0)]);

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.pause().await, Err(SchedulerError::NotRunning));
        assert_eq!(scheduler.resume().await, Err(SchedulerError::NotRunning));
        assert_eq!(scheduler.stop().await, Err(SchedulerError::NotRunning));
        assert!(matches!(
            scheduler.start(Duration::ZERO, None).await,
            Err(SchedulerError::InvalidInterval(_))
        ));

        scheduler.start_configured().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(
            scheduler.start(Duration::from_secs(1), None).await,
            Err(SchedulerError::AlreadyRunning)
        );
        assert_eq!(scheduler.resume().await, Err(SchedulerError::NotPaused));

        assert_ok!(scheduler.pause().await);
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert_err!(scheduler.pause().await);
        assert_ok!(scheduler.resume().await);
        assert_eq!(scheduler.state(), SchedulerState::Running);

        assert_ok!(scheduler.pause().await);
        // Start from Paused restarts the triggers.
        assert_ok!(scheduler.start(Duration::from_secs(2), None).await);
        assert_eq!(scheduler.state(), SchedulerState::Running);

        assert_ok!(scheduler.stop().await);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.trigger_speedtest());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suspends_monitoring() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let scheduler = scheduler(&log, &[Some(10.0)]);

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.pause().await.unwrap();
        let before = read_log(&log).unwrap().records.len();
        assert_eq!(before, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(read_log(&log).unwrap().records.len(), before);

        scheduler.resume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.stop().await.unwrap();
        assert!(read_log(&log).unwrap().records.len() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_reconnect_events() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(
            &dir.path().join("log.csv"),
            &[Some(10.0), None, None, Some(12.0)],
        );
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        scheduler.stop().await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, MonitorEvent::Disconnected { .. }));
        match events.recv().await.unwrap() {
            MonitorEvent::Reconnected { outage_secs, .. } => assert!(outage_secs >= 0.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_failure_does_not_stop_monitoring() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be appended to.
        let scheduler = scheduler(dir.path(), &[Some(10.0)]);
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            MonitorEvent::LogWriteFailed { .. }
        ));
        assert_eq!(scheduler.chart().samples().await.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_speed_test_is_logged_and_monitoring_continues() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let runner = SpeedTestRunner::new(SpeedTestConfig {
            command: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), "exit 1".to_string()]),
            timeout: Duration::from_secs(10),
        });
        let scheduler = Scheduler::new(
            config(Duration::from_millis(50)),
            ScriptedSampler::boxed(&[Some(10.0)]),
            runner,
            LogWriter::open(&log),
        );

        scheduler
            .start(Duration::from_millis(50), Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        let mut failure_row = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let records = read_log(&log).unwrap().records;
            if let Some(i) = records
                .iter()
                .position(|r| r.speedtest_status == Some(SpeedTestStatus::Failure))
            {
                failure_row = Some(i);
                break;
            }
        }
        let failure_row = failure_row.expect("failure row logged");

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await.unwrap();

        let records = read_log(&log).unwrap().records;
        let failed = &records[failure_row];
        assert!(failed.download_mbps.is_none());
        assert!(failed.upload_mbps.is_none());
        assert!(failed.ping_ms.is_none());
        assert!(records.len() > failure_row + 1);
        assert!(records[failure_row + 1..]
            .iter()
            .all(|r| r.speedtest_status.is_none() && r.latency_ms == Some(10.0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_speed_test_finishing_after_stop_is_discarded() {
        let dir = TempDir::new().unwrap();
        let runner = SpeedTestRunner::new(SpeedTestConfig {
            command: Some("sh".to_string()),
            args: Some(vec![
                "-c".to_string(),
                r#"sleep 0.3; echo '{"download": 1000000, "upload": 1000000, "ping": 1}'"#.to_string(),
            ]),
            timeout: Duration::from_secs(10),
        });
        let speed = runner.clone();
        let scheduler = Scheduler::new(
            config(Duration::from_millis(50)),
            ScriptedSampler::boxed(&[Some(10.0)]),
            runner,
            LogWriter::open(dir.path().join("log.csv")),
        );
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        // The slot is taken before the run is spawned, so an immediate
        // second trigger is already refused.
        assert!(scheduler.trigger_speedtest());
        assert!(!scheduler.trigger_speedtest());
        assert!(speed.is_running());

        scheduler.stop().await.unwrap();
        while speed.is_running() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        loop {
            match events.try_recv() {
                Ok(MonitorEvent::SpeedTestCompleted(_)) => panic!("result delivered after stop"),
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        let records = read_log(dir.path().join("log.csv")).unwrap().records;
        assert!(records.iter().all(|r| r.speedtest_status.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_carry_connection_state() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir.path().join("log.csv"), &[None, None, Some(10.0)]);
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await.unwrap();
        assert!(matches!(
            drain(&mut events).as_slice(),
            [MonitorEvent::Disconnected { .. }]
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.start(Duration::from_secs(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await.unwrap();

        // The new run starts connected: no reconnect spanning the stopped time.
        assert!(drain(&mut events).is_empty());
        assert_eq!(scheduler.chart().samples().await.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_result_pending_at_stop_is_logged_in_its_own_run() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let scheduler = Scheduler::new(
            config(Duration::from_secs(3600)),
            ScriptedSampler::boxed(&[Some(10.0)]),
            shell_runner(r#"echo '{"download": 1000000, "upload": 1000000, "ping": 1}'"#),
            LogWriter::open(&log),
        );
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_secs(3600), None).await.unwrap();
        while scheduler.chart().samples().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.trigger_speedtest());
        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(MonitorEvent::SpeedTestCompleted(result)) = events.recv().await {
                    break result;
                }
            }
        })
        .await
        .unwrap();

        // No monitoring tick is due for an hour; stop logs the result.
        scheduler.stop().await.unwrap();
        let records = read_log(&log).unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].speedtest_status, None);
        assert_eq!(records[1].speedtest_status, Some(SpeedTestStatus::Success));
        assert_eq!(records[1].download_mbps, completed.download_mbps);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.start(Duration::from_millis(50), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await.unwrap();

        let records = read_log(&log).unwrap().records;
        assert!(records.len() > 2);
        assert!(records[2..].iter().all(|r| r.speedtest_status.is_none()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_keeps_speed_tests_running() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.csv");
        let runs = dir.path().join("runs");
        let runner = shell_runner(&format!(
            r#"echo run >> '{}'; sleep 0.3; echo '{{"download": 2000000, "upload": 1000000, "ping": 1}}'"#,
            runs.display()
        ));
        let speed = runner.clone();
        let scheduler = Scheduler::new(
            config(Duration::from_millis(50)),
            ScriptedSampler::boxed(&[Some(10.0)]),
            runner,
            LogWriter::open(&log),
        );
        let mut events = scheduler.subscribe();

        // The periodic trigger fires on start; pause while that run is in flight.
        scheduler
            .start(Duration::from_millis(50), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        while !speed.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused_rows = read_log(&log).unwrap().records.len();

        // The in-flight run finishes and the trigger fires again while paused.
        for _ in 0..100 {
            let started = std::fs::read_to_string(&runs).unwrap_or_default().lines().count();
            if started >= 2 && !speed.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let mut seen = drain(&mut events);
        assert!(speed_results(&seen) >= 2);
        assert_eq!(read_log(&log).unwrap().records.len(), paused_rows);

        // After resume both results are logged, one per monitoring row.
        scheduler.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await.unwrap();
        seen.extend(drain(&mut events));

        let records = read_log(&log).unwrap().records;
        let logged: Vec<_> = records[paused_rows..]
            .iter()
            .filter(|r| r.speedtest_status.is_some())
            .collect();
        assert_eq!(records[paused_rows].speedtest_status, Some(SpeedTestStatus::Success));
        assert_eq!(records[paused_rows + 1].speedtest_status, Some(SpeedTestStatus::Success));
        assert_eq!(records[paused_rows].download_mbps, Some(2.0));
        assert_eq!(logged.len(), speed_results(&seen));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_runs_one_traceroute() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(Duration::from_millis(50));
        cfg.traceroute = Some(TracerouteConfig {
            target: "10.0.0.1".to_string(),
            command: Some("sh".to_string()),
            args: Some(vec![
                "-c".to_string(),
                r#"echo " 1  $1  1.0 ms""#.to_string(),
                "sh".to_string(),
            ]),
            timeout: Duration::from_secs(10),
        });
        let scheduler = Scheduler::new(
            cfg,
            ScriptedSampler::boxed(&[Some(10.0), None]),
            idle_runner(),
            LogWriter::open(dir.path().join("log.csv")),
        );
        let mut events = scheduler.subscribe();

        scheduler.start(Duration::from_millis(50), None).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(MonitorEvent::TracerouteCompleted(report)) = events.recv().await {
                    break report;
                }
            }
        })
        .await
        .unwrap();
        assert!(report.success);
        assert_eq!(report.hops, 1);

        // Still disconnected: no further traceroutes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await.unwrap();
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, MonitorEvent::TracerouteCompleted(_))));
        assert_eq!(scheduler.last_traceroute().await, Some(report));
    }

    #[tokio::test]
    async fn test_traceroute_trigger_without_config() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir.path().join("log.csv"), &[Some(1.0)]);
        assert!(!scheduler.trigger_traceroute());
        assert!(scheduler.last_traceroute().await.is_none());
    }
}
