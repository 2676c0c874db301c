//! Job model for pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::common::time::{ts_millis, ts_millis_opt};
use crate::kernel::classifier::ErrorCategory;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle state of a job.
///
/// Transitions form a DAG: `queued -> running -> {completed, failed,
/// cancelled}`, plus `queued -> cancelled`. The store rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the status DAG permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ============================================================================
// Structured payloads
// ============================================================================

/// Structured failure persisted with a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Metadata recorded by the git-workflow hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitMeta {
    pub branch: String,
    pub original_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

// ============================================================================
// Job Model
// ============================================================================

/// One scheduled or on-demand execution of a pipeline handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique. Retries derive theirs from the original id by
    /// appending `-retry<N>`.
    pub id: String,
    pub pipeline_id: String,
    pub status: JobStatus,
    #[serde(with = "ts_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_millis_opt", skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_millis_opt", skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque handler payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Handler return value; present iff completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured failure; present iff failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitMeta>,
    /// Last reported handler progress in `[0.0, 1.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl Job {
    /// Create a queued job. `id` may come from an external caller; a fresh
    /// one is generated otherwise.
    pub fn new(id: Option<String>, pipeline_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            pipeline_id: pipeline_id.into(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            data: if data.is_null() { None } else { Some(data) },
            result: None,
            error: None,
            git: None,
            progress: None,
        }
    }
}

/// Partial update applied atomically by the store.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub git: Option<GitMeta>,
    pub progress: Option<f64>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn completed(result: Value, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: JobFailure, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(now),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_git(mut self, git: GitMeta) -> Self {
        self.git = Some(git);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queued() {
        let job = Job::new(None, "duplicate-detection", serde_json::json!({"n": 1}));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());
    }

    #[test]
    fn external_id_is_kept() {
        let job = Job::new(Some("j1".into()), "p", Value::Null);
        assert_eq!(job.id, "j1");
        assert!(job.data.is_none());
    }

    #[test]
    fn dag_allows_the_documented_edges() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn dag_rejects_everything_else() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
