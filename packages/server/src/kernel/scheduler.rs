//! Cron-driven job creation using tokio-cron-scheduler.
//!
//! Schedules are registered with standard 5-field cron expressions
//! (minute, hour, day-of-month, month, day-of-week) interpreted in the
//! process's local time zone; the seconds field the underlying scheduler
//! expects is prefixed automatically. Overlapping fires are not coalesced:
//! each fire appends a job to the worker queue and bounded concurrency
//! does the rest.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

use super::jobs::Worker;

/// Produces the payload for each fire of a schedule.
pub type PayloadFactory = Arc<dyn Fn() -> Value + Send + Sync>;

struct ScheduleEntry {
    name: String,
    worker: Worker,
    payload: PayloadFactory,
}

/// Registry of recurring triggers plus the run-on-startup list.
pub struct Scheduler {
    inner: JobScheduler,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            entries: Vec::new(),
        })
    }

    /// Register a recurring trigger. Each fire submits a fresh job with the
    /// factory's payload; a still-running prior job just means the new one
    /// waits in the worker queue.
    pub async fn schedule(
        &mut self,
        name: &str,
        cron_expr: &str,
        worker: Worker,
        payload: PayloadFactory,
    ) -> Result<()> {
        let normalized = normalize_cron(cron_expr)
            .with_context(|| format!("invalid cron expression for schedule {name}"))?;

        let job_name = name.to_string();
        let job_worker = worker.clone();
        let job_payload = payload.clone();
        let cron_job = CronJob::new_async_tz(
            normalized.as_str(),
            chrono::Local,
            move |_id, _scheduler| {
                let name = job_name.clone();
                let worker = job_worker.clone();
                let payload = job_payload.clone();
                Box::pin(async move {
                    match worker.submit(None, payload()).await {
                        Ok(job) => {
                            info!(schedule = %name, job_id = %job.id, "schedule fired");
                        }
                        Err(e) => {
                            error!(schedule = %name, error = %e, "scheduled submission failed");
                        }
                    }
                })
            },
        )?;
        self.inner.add(cron_job).await?;

        self.entries.push(ScheduleEntry {
            name: name.to_string(),
            worker,
            payload,
        });
        info!(schedule = %name, cron = %cron_expr, "schedule registered");
        Ok(())
    }

    /// Start firing triggers. With `run_on_startup`, every registered
    /// schedule also fires once immediately.
    pub async fn start(&self, run_on_startup: bool) -> Result<()> {
        if run_on_startup {
            for entry in &self.entries {
                match entry.worker.submit(None, (entry.payload)()).await {
                    Ok(job) => {
                        info!(schedule = %entry.name, job_id = %job.id, "startup fire");
                    }
                    Err(e) => {
                        error!(schedule = %entry.name, error = %e, "startup fire failed");
                    }
                }
            }
        }
        self.inner.start().await?;
        Ok(())
    }

    /// Stop firing triggers. Already-queued jobs are untouched.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Accepts standard 5-field cron and prefixes the seconds field; 6- and
/// 7-field expressions pass through for compatibility.
fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", expr.trim())),
        6 | 7 => Ok(expr.trim().to_string()),
        n => bail!("expected 5 cron fields, got {n}"),
    }
}
