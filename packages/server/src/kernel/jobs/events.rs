//! Lifecycle event emission.
//!
//! Events are facts about the job lifecycle, not commands. Every emission
//! does two things: publish a frame on the event bus for WebSocket fanout,
//! and record a human-readable item in the activity feed (which itself is
//! announced on `activity:new`). Emission is fire-and-forget; it never
//! fails back into the worker runtime.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::common::time::now_millis;
use crate::kernel::activity::{ActivityFeed, ActivityItem, Severity};
use crate::kernel::bus::{channels, EventBus};
use crate::kernel::pipelines::display_name;

use super::job::{Job, JobFailure};

/// Emits lifecycle events to the bus and the activity feed.
#[derive(Clone)]
pub struct JobEvents {
    bus: Arc<EventBus>,
    activity: Arc<ActivityFeed>,
}

impl JobEvents {
    pub fn new(bus: Arc<EventBus>, activity: Arc<ActivityFeed>) -> Self {
        Self { bus, activity }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn activity(&self) -> &Arc<ActivityFeed> {
        &self.activity
    }

    pub async fn job_created(&self, job: &Job) {
        self.publish(channels::JOB_CREATED, job_payload(job)).await;
        self.record(
            ActivityItem::new(
                channels::JOB_CREATED,
                &job.pipeline_id,
                display_name(&job.pipeline_id),
                format!("Job {} queued", job.id),
                Severity::Info,
            )
            .with_job(&job.id),
        )
        .await;
    }

    pub async fn job_started(&self, job: &Job) {
        self.publish(channels::JOB_STARTED, job_payload(job)).await;
        self.record(
            ActivityItem::new(
                channels::JOB_STARTED,
                &job.pipeline_id,
                display_name(&job.pipeline_id),
                format!("Job {} started", job.id),
                Severity::Info,
            )
            .with_job(&job.id),
        )
        .await;
    }

    /// Progress is bus-only; it is too chatty for the activity feed.
    pub async fn job_progress(&self, job_id: &str, pipeline_id: &str, progress: f64) {
        self.publish(
            channels::JOB_PROGRESS,
            json!({
                "job_id": job_id,
                "pipeline_id": pipeline_id,
                "progress": progress,
                "timestamp": now_millis(),
            }),
        )
        .await;
    }

    pub async fn job_completed(&self, job: &Job) {
        self.publish(channels::JOB_COMPLETED, job_payload(job)).await;
        self.record(
            ActivityItem::new(
                channels::JOB_COMPLETED,
                &job.pipeline_id,
                display_name(&job.pipeline_id),
                format!("Job {} completed", job.id),
                Severity::Info,
            )
            .with_job(&job.id),
        )
        .await;
    }

    pub async fn job_failed(&self, job: &Job, failure: &JobFailure) {
        let mut payload = job_payload(job);
        payload["error"] = serde_json::to_value(failure).unwrap_or(Value::Null);
        self.publish(channels::JOB_FAILED, payload).await;
        self.record(
            ActivityItem::new(
                channels::JOB_FAILED,
                &job.pipeline_id,
                display_name(&job.pipeline_id),
                format!("Job {} failed: {}", job.id, failure.message),
                Severity::Error,
            )
            .with_job(&job.id)
            .with_details(json!({"category": failure.category})),
        )
        .await;
    }

    pub async fn job_cancelled(&self, job: &Job) {
        self.publish(channels::JOB_CANCELLED, job_payload(job)).await;
        self.record(
            ActivityItem::new(
                channels::JOB_CANCELLED,
                &job.pipeline_id,
                display_name(&job.pipeline_id),
                format!("Job {} cancelled", job.id),
                Severity::Warning,
            )
            .with_job(&job.id),
        )
        .await;
    }

    pub async fn retry_scheduled(
        &self,
        pipeline_id: &str,
        original_id: &str,
        retry_id: &str,
        attempt: u32,
        delay_ms: u128,
    ) {
        self.publish(
            channels::RETRY_SCHEDULED,
            json!({
                "pipeline_id": pipeline_id,
                "original_id": original_id,
                "retry_id": retry_id,
                "attempt": attempt,
                "delay_ms": delay_ms as u64,
                "timestamp": now_millis(),
            }),
        )
        .await;
        self.record(
            ActivityItem::new(
                channels::RETRY_SCHEDULED,
                pipeline_id,
                display_name(pipeline_id),
                format!("Retry {attempt} of {original_id} scheduled in {delay_ms}ms"),
                Severity::Warning,
            )
            .with_job(retry_id),
        )
        .await;
    }

    /// Alert emitted when a cap aborts the retry chain, or when a chain is
    /// approaching its configured limit.
    pub async fn retry_alert(
        &self,
        pipeline_id: &str,
        original_id: &str,
        attempt: u32,
        severity: Severity,
        reason: &str,
        exhausted: bool,
    ) {
        if exhausted {
            self.publish(
                channels::RETRY_MAX_ATTEMPTS,
                json!({
                    "pipeline_id": pipeline_id,
                    "original_id": original_id,
                    "attempts": attempt,
                    "reason": reason,
                    "timestamp": now_millis(),
                }),
            )
            .await;
        }
        self.record(
            ActivityItem::new(
                if exhausted {
                    channels::RETRY_MAX_ATTEMPTS
                } else {
                    channels::RETRY_SCHEDULED
                },
                pipeline_id,
                display_name(pipeline_id),
                format!("{reason} ({original_id}, attempt {attempt})"),
                severity,
            )
            .with_job(original_id),
        )
        .await;
    }

    /// Broadcast a freshly derived pipeline status after a terminal
    /// transition.
    pub async fn pipeline_status(&self, status: &crate::kernel::pipelines::PipelineStatus) {
        let payload = serde_json::to_value(status).unwrap_or(Value::Null);
        self.publish(channels::PIPELINE_STATUS, payload).await;
    }

    pub async fn system_status(&self, state: &str) {
        self.publish(
            channels::SYSTEM_STATUS,
            json!({"state": state, "timestamp": now_millis()}),
        )
        .await;
    }

    async fn publish(&self, channel: &str, payload: Value) {
        self.bus.publish(channel, payload).await;
    }

    async fn record(&self, item: ActivityItem) {
        self.activity.record(item.clone());
        let payload = serde_json::to_value(&item).unwrap_or(Value::Null);
        self.bus.publish(channels::ACTIVITY_NEW, payload).await;
    }
}

fn job_payload(job: &Job) -> Value {
    json!({
        "job_id": job.id,
        "pipeline_id": job.pipeline_id,
        "status": job.status,
        "timestamp": now_millis(),
    })
}
