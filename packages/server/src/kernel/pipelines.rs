//! Pipeline registry: display names and derived pipeline status.
//!
//! A pipeline is not a stored entity; it exists implicitly once a job with
//! its id is inserted. Display fields are computed on demand from store
//! aggregates.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::time::ts_millis_opt;

use super::jobs::{JobStatus, JobStore, StoreError};

/// Static id -> display name table. Unknown ids map to themselves.
const PIPELINE_NAMES: &[(&str, &str)] = &[
    ("repomix", "Repomix"),
    ("duplicate-detection", "Duplicate Detection"),
    ("gitignore-manager", "Gitignore Manager"),
    ("doc-generation", "Documentation Generation"),
    ("repository-scan", "Repository Scan"),
];

pub fn display_name(pipeline_id: &str) -> String {
    PIPELINE_NAMES
        .iter()
        .find(|(id, _)| *id == pipeline_id)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| pipeline_id.to_string())
}

/// Aggregate health of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Running,
    Failing,
    Idle,
}

/// One row of the `/api/status` pipeline list.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub name: String,
    pub status: PipelineState,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    #[serde(with = "ts_millis_opt")]
    pub last_run: Option<DateTime<Utc>>,
    /// The scheduler does not expose the next firing time yet.
    pub next_run: Option<String>,
}

/// Derive the displayable status of one pipeline from store aggregates.
pub async fn pipeline_status(store: &JobStore, id: &str) -> Result<PipelineStatus, StoreError> {
    let counts = store.count_by_status(id).await?;
    let last_job = store.last_job(id).await?;
    let last_run = store.last_run(id).await?;

    let status = if counts.running > 0 {
        PipelineState::Running
    } else if last_job.map(|job| job.status) == Some(JobStatus::Failed)
        && counts.failed >= counts.completed
    {
        PipelineState::Failing
    } else {
        PipelineState::Idle
    };

    Ok(PipelineStatus {
        id: id.to_string(),
        name: display_name(id),
        status,
        completed_jobs: counts.completed,
        failed_jobs: counts.failed,
        last_run,
        next_run: None,
    })
}

/// Derive the status list for every pipeline present in the store,
/// ordered by id for a deterministic response.
pub async fn compose_status(store: &JobStore) -> Result<Vec<PipelineStatus>, StoreError> {
    let mut statuses = Vec::new();
    for id in store.list_pipeline_ids().await? {
        statuses.push(pipeline_status(store, &id).await?);
    }
    Ok(statuses)
}
