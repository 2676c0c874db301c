//! Application setup and server configuration.
//!
//! `build_runtime` constructs the dependency graph once at startup
//! (store, bus, activity feed, retry controller, workers, scheduler) and
//! hands explicit handles to everything that needs them. No component
//! reaches for a global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::kernel::activity::ActivityFeed;
use crate::kernel::bus::EventBus;
use crate::kernel::git::{DefaultGitHooks, DryRunGit, GitHook, GitWorkflow};
use crate::kernel::jobs::{
    JobEvents, JobStore, RetryController, RetryPolicy, Worker, WorkerConfig,
    ABSOLUTE_MAX_ATTEMPTS,
};
use crate::kernel::scheduler::Scheduler;
use crate::pipelines::scan::{self, ScanHandler};
use crate::server::routes::{
    all_jobs_handler, health_handler, pipeline_jobs_handler, scan_results_handler,
    scan_status_handler, start_scan_handler, start_scan_multi_handler, status_handler,
};
use crate::server::ws::{ws_handler, ws_status_handler};

/// Per-route timeout applied by the gateway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub bus: Arc<EventBus>,
    pub activity: Arc<ActivityFeed>,
    pub retry: Arc<RetryController>,
    pub events: JobEvents,
    pub workers: Arc<HashMap<String, Worker>>,
    pub environment: String,
}

impl AppState {
    pub fn worker(&self, pipeline_id: &str) -> Option<&Worker> {
        self.workers.get(pipeline_id)
    }

    pub fn scan_worker(&self) -> Result<&Worker, crate::server::error::ApiError> {
        self.worker(scan::PIPELINE_ID).ok_or_else(|| {
            crate::server::error::ApiError::Internal("scan worker not registered".into())
        })
    }
}

/// Everything a long-running process needs to drive the system.
pub struct Runtime {
    pub state: AppState,
    pub scheduler: Scheduler,
    shutdown_grace: Duration,
}

impl Runtime {
    /// Graceful shutdown: stop triggers, announce, kill pending retry
    /// timers, then quiesce workers up to the configured grace period.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "scheduler shutdown failed");
        }
        self.state.events.system_status("stopping").await;
        self.state.retry.shutdown();
        for worker in self.state.workers.values() {
            worker.shutdown(self.shutdown_grace).await;
        }
        info!("runtime stopped");
    }
}

/// Construct the full dependency graph from configuration. The scheduler
/// is registered but not started; callers decide when triggers begin
/// firing.
pub async fn build_runtime(config: &Config) -> Result<Runtime> {
    let store = JobStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening job store at {}", config.db_path.display()))?;

    let bus = Arc::new(EventBus::new());
    let activity = Arc::new(ActivityFeed::new(config.activity_capacity));
    let events = JobEvents::new(bus.clone(), activity.clone());
    let retry = Arc::new(RetryController::new(RetryPolicy {
        max_attempts: config.retry_max_attempts,
        base_delay: config.retry_base_delay,
    }));

    info!(
        db_path = %config.db_path.display(),
        retry_max_attempts = config.retry_max_attempts,
        retry_absolute_cap = ABSOLUTE_MAX_ATTEMPTS,
        worker_max_concurrent = config.worker_max_concurrent,
        environment = %config.environment,
        "runtime configuration"
    );

    let mut scan_config = WorkerConfig::new(scan::PIPELINE_ID, config.worker_max_concurrent);
    if config.git.enabled {
        if !config.git.dry_run {
            // The core ships no VCS binding; a real one plugs in here.
            warn!("git workflow enabled without a VCS binding, running dry");
        }
        let workflow: Arc<dyn GitWorkflow> = Arc::new(DryRunGit::new(&config.git.base_branch));
        scan_config = scan_config.with_git(GitHook::new(
            config.git.clone(),
            workflow,
            Arc::new(DefaultGitHooks),
        ));
    }

    let scan_worker = Worker::new(
        scan_config,
        store.clone(),
        events.clone(),
        retry.clone(),
        Arc::new(ScanHandler),
    );
    scan_worker.spawn_dispatcher();

    let mut workers = HashMap::new();
    workers.insert(scan::PIPELINE_ID.to_string(), scan_worker.clone());

    let mut scheduler = Scheduler::new().await?;
    if let Some(cron) = &config.scan_cron {
        let repository = config.scan_repository_path.display().to_string();
        scheduler
            .schedule(
                scan::PIPELINE_ID,
                cron,
                scan_worker,
                Arc::new(move || json!({"repository_path": repository.clone()})),
            )
            .await?;
    }

    let state = AppState {
        store,
        bus,
        activity,
        retry,
        events,
        workers: Arc::new(workers),
        environment: config.environment.clone(),
    };

    Ok(Runtime {
        state,
        scheduler,
        shutdown_grace: config.shutdown_grace,
    })
}

/// Build the Axum application router.
///
/// Specific routes are registered before parametric ones, and the
/// WebSocket status endpoint lives under its own `/ws` prefix, so nothing
/// can shadow it.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(all_jobs_handler))
        .route("/api/pipelines/:pipeline_id/jobs", get(pipeline_jobs_handler))
        .route("/api/scans/start", post(start_scan_handler))
        .route("/api/scans/start-multi", post(start_scan_multi_handler))
        .route("/api/scans/:job_id/status", get(scan_status_handler))
        .route("/api/scans/:job_id/results", get(scan_results_handler))
        .route("/ws/status", get(ws_status_handler))
        .route("/ws", get(ws_handler))
        .layer(Extension(state))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
