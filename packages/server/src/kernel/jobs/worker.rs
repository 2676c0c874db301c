//! Per-pipeline worker runtime.
//!
//! A `Worker` owns one pipeline's FIFO queue and its execution slots:
//!
//! ```text
//! submit()
//!     │ persist {queued} ─► publish job:created ─► push queue ─► wake loop
//!     ▼
//! dispatch loop (one task per worker)
//!     │ while slots free: pop head ─► spawn run_job
//!     ▼
//! run_job
//!     ├─► persist {running}, publish job:started
//!     ├─► handler.run(job, ctx) under a cancellation token
//!     ├─► ok        ─► persist {completed, result}, publish job:completed
//!     ├─► cancelled ─► persist {cancelled}, publish job:cancelled
//!     └─► error     ─► RetryController verdict ─► terminal failure
//!                       or a delayed resubmission as `<id>-retry<N>`
//! ```
//!
//! `max_concurrent` is dynamic and zero is honoured literally: a worker
//! constructed with zero slots holds every submission in `queued` until the
//! limit is raised. The slot count is released on every exit path,
//! including handler panics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kernel::classifier::JobError;
use crate::kernel::git::GitHook;

use super::events::JobEvents;
use super::job::{Job, JobFailure, JobPatch, JobStatus};
use super::retry::{original_id, RetryController, RetryDecision};
use super::store::{JobStore, StoreError};

/// Errors surfaced by worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handler contract: the opaque pipeline body.
///
/// Handlers observe `ctx` for cooperative cancellation and may report
/// progress through it. The returned value is persisted as the job result.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job, ctx: JobContext) -> Result<Value, JobError>;
}

/// Execution context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    pipeline_id: String,
    cancel: CancellationToken,
    store: JobStore,
    events: JobEvents,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        pipeline_id: String,
        cancel: CancellationToken,
        store: JobStore,
        events: JobEvents,
    ) -> Self {
        Self {
            job_id,
            pipeline_id,
            cancel,
            store,
            events,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the job is cancelled; for use in `select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Bail out if cancellation was requested. Handlers should call this at
    /// natural checkpoints.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::new("job cancelled"))
        } else {
            Ok(())
        }
    }

    /// Persist and broadcast handler progress (last write wins).
    pub async fn report_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        if let Err(e) = self
            .store
            .update(&self.job_id, JobPatch::progress(progress))
            .await
        {
            debug!(job_id = %self.job_id, error = %e, "progress update skipped");
        }
        self.events
            .job_progress(&self.job_id, &self.pipeline_id, progress)
            .await;
    }
}

/// Static configuration for one worker.
#[derive(Clone)]
pub struct WorkerConfig {
    pub pipeline_id: String,
    /// Slot count; 0 holds all jobs queued until raised.
    pub max_concurrent: usize,
    /// Optional git workflow wrapped around the handler.
    pub git: Option<GitHook>,
}

impl WorkerConfig {
    pub fn new(pipeline_id: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            max_concurrent,
            git: None,
        }
    }

    pub fn with_git(mut self, git: GitHook) -> Self {
        self.git = Some(git);
        self
    }
}

/// Point-in-time queue metrics for the status endpoint.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub pipeline_id: String,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

struct WorkerInner {
    pipeline_id: String,
    store: JobStore,
    events: JobEvents,
    retry: Arc<RetryController>,
    handler: Arc<dyn JobHandler>,
    git: Option<GitHook>,
    queue: Mutex<VecDeque<String>>,
    running: Mutex<HashMap<String, CancellationToken>>,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
    notify: tokio::sync::Notify,
    /// Stops the dispatch loop; queued jobs stay queued.
    loop_token: CancellationToken,
    /// Parent of every per-job handler token; fired when the grace period
    /// runs out.
    cancel_all: CancellationToken,
    accepting: AtomicBool,
}

/// Cloneable handle to one pipeline's worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: JobStore,
        events: JobEvents,
        retry: Arc<RetryController>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                pipeline_id: config.pipeline_id,
                store,
                events,
                retry,
                handler,
                git: config.git,
                queue: Mutex::new(VecDeque::new()),
                running: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(config.max_concurrent),
                notify: tokio::sync::Notify::new(),
                loop_token: CancellationToken::new(),
                cancel_all: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.inner.pipeline_id
    }

    /// Spawn the dispatch loop. Call once after construction.
    pub fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        info!(
            pipeline_id = %inner.pipeline_id,
            max_concurrent = inner.max_concurrent.load(Ordering::Relaxed),
            "worker starting"
        );
        tokio::spawn(async move {
            WorkerInner::dispatch_loop(inner).await;
        })
    }

    /// Persist a queued job, announce it, and wake the dispatcher.
    pub async fn submit(&self, id: Option<String>, data: Value) -> Result<Job, WorkerError> {
        self.inner.submit(id, data).await
    }

    /// Cancel a job: queued jobs terminate immediately, running jobs
    /// cooperatively, and pending retry timers for the chain become no-ops.
    /// Returns `Ok(false)` when the job is already terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, WorkerError> {
        self.inner.cancel(job_id).await
    }

    /// Raise or lower the slot count. Raising dispatches queued jobs in
    /// FIFO order; lowering only affects future dispatches.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        self.inner
            .max_concurrent
            .store(max_concurrent, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    pub fn metrics(&self) -> WorkerMetrics {
        let queued = match self.inner.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        WorkerMetrics {
            pipeline_id: self.inner.pipeline_id.clone(),
            queued,
            active: self.inner.active.load(Ordering::Relaxed),
            max_concurrent: self.inner.max_concurrent.load(Ordering::Relaxed),
        }
    }

    /// Quiesce: refuse new submissions, stop dispatching, wait for in-flight
    /// handlers up to `grace`, then cancel whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Relaxed);
        inner.loop_token.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        while inner.active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let leftover = inner.active.load(Ordering::Relaxed);
        if leftover > 0 {
            warn!(
                pipeline_id = %inner.pipeline_id,
                count = leftover,
                "grace period elapsed, cancelling in-flight jobs"
            );
            inner.cancel_all.cancel();
            let force_deadline = tokio::time::Instant::now() + Duration::from_secs(1);
            while inner.active.load(Ordering::Relaxed) > 0
                && tokio::time::Instant::now() < force_deadline
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        info!(pipeline_id = %inner.pipeline_id, "worker stopped");
    }
}

impl WorkerInner {
    fn queue_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn running_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Re-derive and broadcast this pipeline's status; best effort.
    async fn announce_pipeline_status(&self) {
        match crate::kernel::pipelines::pipeline_status(&self.store, &self.pipeline_id).await {
            Ok(status) => self.events.pipeline_status(&status).await,
            Err(e) => {
                debug!(pipeline_id = %self.pipeline_id, error = %e, "status derivation failed");
            }
        }
    }

    async fn submit(self: &Arc<Self>, id: Option<String>, data: Value) -> Result<Job, WorkerError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(WorkerError::ShuttingDown);
        }

        let job = Job::new(id, self.pipeline_id.clone(), data);
        self.store.insert(&job).await?;
        self.events.job_created(&job).await;
        self.queue_lock().push_back(job.id.clone());
        self.notify.notify_one();
        debug!(pipeline_id = %self.pipeline_id, job_id = %job.id, "job queued");
        Ok(job)
    }

    async fn dispatch_loop(inner: Arc<Self>) {
        loop {
            loop {
                let max = inner.max_concurrent.load(Ordering::Relaxed);
                if max == 0 || inner.active.load(Ordering::Relaxed) >= max {
                    break;
                }
                let Some(job_id) = inner.queue_lock().pop_front() else {
                    break;
                };
                inner.active.fetch_add(1, Ordering::SeqCst);
                let inner = inner.clone();
                tokio::spawn(async move {
                    Self::run_job(inner, job_id).await;
                });
            }

            tokio::select! {
                _ = inner.loop_token.cancelled() => break,
                _ = inner.notify.notified() => {}
            }
        }
    }

    /// Runs one job and releases the slot no matter how execution ends.
    async fn run_job(inner: Arc<Self>, job_id: String) {
        let execution = tokio::spawn(Self::execute(inner.clone(), job_id.clone()));
        match execution.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "job bookkeeping failed");
            }
            Err(join_err) => {
                // Handler panicked; record the wreckage and move on.
                error!(job_id = %job_id, error = %join_err, "handler panicked");
                let failure = JobFailure {
                    message: format!("handler panicked: {join_err}"),
                    code: None,
                    category: Default::default(),
                    stack: None,
                };
                if let Ok(job) = inner
                    .store
                    .update(&job_id, JobPatch::failed(failure.clone(), Utc::now()))
                    .await
                {
                    inner.events.job_failed(&job, &failure).await;
                }
                inner.running_lock().remove(&job_id);
                inner.retry.resolve(&job_id);
                inner.announce_pipeline_status().await;
            }
        }
        inner.active.fetch_sub(1, Ordering::SeqCst);
        inner.notify.notify_one();
    }

    async fn execute(inner: Arc<Self>, job_id: String) -> Result<(), StoreError> {
        let job = match inner.store.get(&job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        // Cancelled while still in the queue; nothing to run.
        if job.status != JobStatus::Queued {
            return Ok(());
        }

        let job = inner
            .store
            .update(&job_id, JobPatch::started(Utc::now()))
            .await?;
        inner.events.job_started(&job).await;

        let token = inner.cancel_all.child_token();
        inner.running_lock().insert(job_id.clone(), token.clone());

        let ctx = JobContext::new(
            job_id.clone(),
            inner.pipeline_id.clone(),
            token.clone(),
            inner.store.clone(),
            inner.events.clone(),
        );

        let outcome = match &inner.git {
            Some(git) => git.run(&job, inner.handler.as_ref(), ctx).await,
            None => inner
                .handler
                .run(job.clone(), ctx)
                .await
                .map(|value| (value, None)),
        };

        inner.running_lock().remove(&job_id);

        if token.is_cancelled() {
            let job = inner
                .store
                .update(&job_id, JobPatch::cancelled(Utc::now()))
                .await?;
            inner.events.job_cancelled(&job).await;
            inner.retry.resolve(&job_id);
            inner.announce_pipeline_status().await;
            return Ok(());
        }

        match outcome {
            Ok((value, git_meta)) => {
                let mut patch = JobPatch::completed(value, Utc::now());
                if let Some(meta) = git_meta {
                    patch = patch.with_git(meta);
                }
                let job = inner.store.update(&job_id, patch).await?;
                inner.events.job_completed(&job).await;
                inner.retry.resolve(&job_id);
            }
            Err(job_error) => {
                Self::handle_failure(inner.clone(), job, job_error).await?;
            }
        }
        inner.announce_pipeline_status().await;
        Ok(())
    }

    async fn handle_failure(
        inner: Arc<Self>,
        job: Job,
        job_error: JobError,
    ) -> Result<(), StoreError> {
        let job_id = job.id.clone();
        let original = original_id(&job_id);
        let decision = inner.retry.evaluate(&job_id, &job_error);

        match decision {
            RetryDecision::Terminal {
                classification,
                alert,
            } => {
                if let Some(alert) = alert {
                    inner
                        .events
                        .retry_alert(
                            &inner.pipeline_id,
                            &original,
                            alert.attempt,
                            alert.severity,
                            &alert.reason,
                            alert.exhausted,
                        )
                        .await;
                }
                let failure = JobFailure {
                    message: job_error.message,
                    code: classification.code,
                    category: classification.category,
                    stack: None,
                };
                let job = inner
                    .store
                    .update(&job_id, JobPatch::failed(failure.clone(), Utc::now()))
                    .await?;
                inner.events.job_failed(&job, &failure).await;
            }
            RetryDecision::Retry {
                classification,
                retry_id,
                attempt,
                delay,
                alert,
            } => {
                if let Some(alert) = alert {
                    inner
                        .events
                        .retry_alert(
                            &inner.pipeline_id,
                            &original,
                            alert.attempt,
                            alert.severity,
                            &alert.reason,
                            alert.exhausted,
                        )
                        .await;
                }

                // Keep the failed attempt on record, but the chain is not
                // final: no job:failed until retries are exhausted.
                let failure = JobFailure {
                    message: job_error.message,
                    code: classification.code,
                    category: classification.category,
                    stack: None,
                };
                inner
                    .store
                    .update(&job_id, JobPatch::failed(failure, Utc::now()))
                    .await?;

                inner
                    .events
                    .retry_scheduled(
                        &inner.pipeline_id,
                        &original,
                        &retry_id,
                        attempt,
                        delay.as_millis(),
                    )
                    .await;

                let token = CancellationToken::new();
                let timer_id = inner.retry.register_timer(&retry_id, token.clone());
                let data = job.data.clone().unwrap_or(Value::Null);
                let resubmit = inner.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            resubmit.retry.timer_done(&retry_id, timer_id);
                            match resubmit.submit(Some(retry_id.clone()), data).await {
                                Ok(_) => {
                                    debug!(job_id = %retry_id, "retry submitted");
                                }
                                Err(e) => {
                                    error!(job_id = %retry_id, error = %e, "retry submission failed");
                                }
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }

    async fn cancel(self: &Arc<Self>, job_id: &str) -> Result<bool, WorkerError> {
        // Still waiting for a slot: drop it from the queue and finish it now.
        let was_queued = {
            let mut queue = self.queue_lock();
            match queue.iter().position(|id| id == job_id) {
                Some(index) => {
                    queue.remove(index);
                    true
                }
                None => false,
            }
        };
        if was_queued {
            let job = self
                .store
                .update(job_id, JobPatch::cancelled(Utc::now()))
                .await?;
            self.events.job_cancelled(&job).await;
            self.retry.cancel_pending(job_id);
            self.retry.resolve(job_id);
            self.announce_pipeline_status().await;
            return Ok(true);
        }

        // Running: cooperative cancellation through the handler context.
        let running_token = self.running_lock().get(job_id).cloned();
        if let Some(token) = running_token {
            token.cancel();
            self.retry.cancel_pending(job_id);
            return Ok(true);
        }

        // Neither queued nor running here; a retry may still be pending.
        self.retry.cancel_pending(job_id);

        match self.store.get(job_id).await {
            Ok(job) if job.status == JobStatus::Queued => {
                let job = self
                    .store
                    .update(job_id, JobPatch::cancelled(Utc::now()))
                    .await?;
                self.events.job_cancelled(&job).await;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
