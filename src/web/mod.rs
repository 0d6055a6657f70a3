//! Web dashboard module.

mod handlers;

use crate::config::MonitorConfig;
use crate::report::ReportGenerator;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MonitorConfig>,
    pub scheduler: Arc<Scheduler>,
    pub reports: ReportGenerator,
    pub log_path: PathBuf,
}

/// Dashboard server over the scheduler's chart buffers and controls.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: Arc<MonitorConfig>, scheduler: Arc<Scheduler>) -> Self {
        let reports = ReportGenerator::new(&config.reports_dir);
        let log_path = config.log_path.clone();
        Self {
            state: AppState {
                config,
                scheduler,
                reports,
                log_path,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Dashboard
            .route("/", get(handlers::handle_dashboard))
            // Read-only API
            .route("/api/state", get(handlers::handle_state))
            .route("/api/samples", get(handlers::handle_samples))
            .route("/api/speedtests", get(handlers::handle_speedtests))
            // Controls
            .route("/api/start", post(handlers::handle_start))
            .route("/api/stop", post(handlers::handle_stop))
            .route("/api/pause", post(handlers::handle_pause))
            .route("/api/resume", post(handlers::handle_resume))
            .route("/api/speedtest", post(handlers::handle_speedtest))
            .route(
                "/api/traceroute",
                get(handlers::handle_last_traceroute).post(handlers::handle_traceroute),
            )
            .route("/api/report", post(handlers::handle_report))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Dashboard listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
