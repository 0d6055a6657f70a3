//! netpulse - Network Stability Monitor
//!
//! Periodically probes network targets, samples host utilisation, runs
//! speed tests, logs everything to CSV and produces HTML/JSON reports.

mod chart;
mod config;
mod metrics;
mod probe;
mod report;
mod scheduler;
mod speedtest;
mod store;
mod traceroute;
mod web;

use config::{minutes_to_interval, secs_to_duration, MonitorConfig};
use probe::ProbeKind;
use report::{ReportGenerator, TimeRange};
use scheduler::{Scheduler, SchedulerState};
use speedtest::SpeedTestRunner;
use web::Server;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// netpulse command line interface
#[derive(Parser)]
#[command(name = "netpulse")]
#[command(about = "Network stability monitor with speed tests and reports")]
#[command(version)]
struct Cli {
    /// CSV log file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Directory reports are written to
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor until Ctrl-C, then write a report
    Monitor(MonitorArgs),

    /// Write a report from an existing log
    Report {
        /// Only include rows at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only include rows at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Run one speed test and print the result as JSON
    Speedtest,
}

#[derive(Args, Default)]
struct MonitorArgs {
    /// Monitoring interval in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Speed-test interval in minutes (0 disables)
    #[arg(long)]
    speedtest_interval: Option<f64>,

    /// Probe target; repeat for several targets
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Probe kind: ping, tcp, http or dns
    #[arg(long)]
    probe: Option<ProbeKind>,

    /// Dashboard port (0 disables)
    #[arg(long)]
    port: Option<u16>,

    /// Do not write a report on exit
    #[arg(long)]
    no_report: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Load configuration
    let mut cfg = MonitorConfig::load()?;
    if let Some(log) = cli.log {
        cfg.log_path = log;
    }
    if let Some(dir) = cli.reports_dir {
        cfg.reports_dir = dir;
    }

    init_tracing(cfg.readable_log.as_deref())?;

    match cli.command.unwrap_or(Commands::Monitor(MonitorArgs::default())) {
        Commands::Monitor(args) => {
            let no_report = args.no_report;
            apply_monitor_args(&mut cfg, args)?;
            cfg.validate()?;
            run_monitor(cfg, no_report).await
        }
        Commands::Report { since, until } => run_report(&cfg, TimeRange::new(since, until)).await,
        Commands::Speedtest => run_speedtest(&cfg).await,
    }
}

/// Console logging plus an optional plain-text copy in a file.
fn init_tracing(readable_log: Option<&Path>) -> Result<(), BoxError> {
    let file_layer = match readable_log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive("netpulse=info".parse()?))
        .init();

    Ok(())
}

fn apply_monitor_args(cfg: &mut MonitorConfig, args: MonitorArgs) -> Result<(), BoxError> {
    if let Some(secs) = args.interval {
        cfg.monitoring_interval = secs_to_duration("--interval", secs)?;
    }
    if let Some(minutes) = args.speedtest_interval {
        cfg.speedtest_interval = minutes_to_interval(minutes);
    }
    if !args.targets.is_empty() {
        cfg.targets = args.targets;
    }
    if let Some(kind) = args.probe {
        cfg.probe = kind;
    }
    if let Some(port) = args.port {
        cfg.http_port = port;
    }
    Ok(())
}

async fn run_monitor(cfg: MonitorConfig, no_report: bool) -> Result<(), BoxError> {
    let cfg = Arc::new(cfg);
    tracing::info!(
        "Monitoring {} via {} every {:?}, logging to {}",
        cfg.targets.join(", "),
        cfg.probe,
        cfg.monitoring_interval,
        cfg.log_path.display()
    );

    let scheduler = Arc::new(Scheduler::from_config(&cfg));
    scheduler.start_configured().await?;

    // Start web server
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let server_task = if cfg.http_port != 0 {
        let server = Server::new(cfg.clone(), scheduler.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = server.start(shutdown).await {
                tracing::error!("Dashboard server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("Dashboard disabled");
        None
    };

    signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    let _ = shutdown_tx.send(());
    if scheduler.state() != SchedulerState::Stopped {
        scheduler.stop().await?;
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }

    if !no_report {
        run_report(&cfg, TimeRange::all()).await?;
    }
    Ok(())
}

async fn run_report(cfg: &MonitorConfig, range: TimeRange) -> Result<(), BoxError> {
    let generator = ReportGenerator::new(&cfg.reports_dir);
    let log_path = cfg.log_path.clone();

    let (report, files) =
        tokio::task::spawn_blocking(move || generator.generate_and_save(&log_path, &range))
            .await??;

    if report.sample_count == 0 {
        tracing::warn!("No samples in the selected window");
    }
    println!("HTML report: {}", files.html.display());
    println!("JSON summary: {}", files.json.display());
    Ok(())
}

async fn run_speedtest(cfg: &MonitorConfig) -> Result<(), BoxError> {
    let runner = SpeedTestRunner::new(cfg.speedtest.clone());
    if let Some(result) = runner.try_run().await {
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.is_success() {
            process::exit(1);
        }
    }
    Ok(())
}
