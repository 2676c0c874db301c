// Common test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use server_core::kernel::activity::ActivityFeed;
use server_core::kernel::bus::EventBus;
use server_core::kernel::jobs::{
    Job, JobEvents, JobHandler, JobStatus, JobStore, RetryController, RetryPolicy, Worker,
    WorkerConfig,
};
use server_core::pipelines::scan::{ScanHandler, PIPELINE_ID};
use server_core::server::{build_app, AppState};

/// Build an app state around one worker with the given handler and policy.
pub async fn state_with_handler(
    pipeline_id: &str,
    handler: Arc<dyn JobHandler>,
    max_concurrent: usize,
    policy: RetryPolicy,
) -> AppState {
    let store = JobStore::in_memory().await.expect("in-memory store");
    let bus = Arc::new(EventBus::new());
    let activity = Arc::new(ActivityFeed::default());
    let events = JobEvents::new(bus.clone(), activity.clone());
    let retry = Arc::new(RetryController::new(policy));

    let worker = Worker::new(
        WorkerConfig::new(pipeline_id, max_concurrent),
        store.clone(),
        events.clone(),
        retry.clone(),
        handler,
    );
    worker.spawn_dispatcher();

    let mut workers = HashMap::new();
    workers.insert(pipeline_id.to_string(), worker);

    AppState {
        store,
        bus,
        activity,
        retry,
        events,
        workers: Arc::new(workers),
        environment: "test".to_string(),
    }
}

/// State with the real repository scan handler registered.
pub async fn scan_state() -> AppState {
    state_with_handler(
        PIPELINE_ID,
        Arc::new(ScanHandler),
        2,
        RetryPolicy::default(),
    )
    .await
}

/// Serve the app on an ephemeral port and return its address.
pub async fn spawn_app(state: AppState) -> SocketAddr {
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Poll the store until a job reaches `status` (or panic after ~2s).
pub async fn wait_for_status(store: &JobStore, job_id: &str, status: JobStatus) -> Job {
    for _ in 0..200 {
        if let Ok(job) = store.get(job_id).await {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status:?}");
}

/// Drive one job through queued -> running -> terminal in the store
/// directly, bypassing workers. Handy for seeding aggregate queries.
pub async fn seed_terminal_job(store: &JobStore, id: &str, pipeline_id: &str, completed: bool) {
    use chrono::Utc;
    use serde_json::json;
    use server_core::kernel::classifier::ErrorCategory;
    use server_core::kernel::jobs::{JobFailure, JobPatch};

    store
        .insert(&Job::new(Some(id.to_string()), pipeline_id, json!(null)))
        .await
        .expect("seed insert");
    store
        .update(id, JobPatch::started(Utc::now()))
        .await
        .expect("seed start");
    if completed {
        store
            .update(id, JobPatch::completed(json!({"ok": true}), Utc::now()))
            .await
            .expect("seed complete");
    } else {
        store
            .update(
                id,
                JobPatch::failed(
                    JobFailure {
                        message: "seeded failure".to_string(),
                        code: None,
                        category: ErrorCategory::Unknown,
                        stack: None,
                    },
                    Utc::now(),
                ),
            )
            .await
            .expect("seed fail");
    }
}
