//! Sqlite-backed job store.
//!
//! The store is the sole owner of durable job state; every mutation goes
//! through [`JobStore::insert`] or [`JobStore::update`]. Status changes are
//! validated against the lifecycle DAG inside the update transaction, so a
//! crash can never leave an illegal history on disk.
//!
//! Timestamps and JSON payloads are persisted as text; the column naming
//! (`data_json`, ...) never leaks past this module.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::common::pagination::ValidatedPageArgs;
use crate::common::time::fmt_millis;

use super::job::{Job, JobPatch, JobStatus};

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    DuplicateId(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("illegal status transition {from} -> {to} for job {id}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("corrupt {column} payload for job {id}")]
    Corrupt { id: String, column: &'static str },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Convenience filter for job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTab {
    /// Jobs created within the last 24 hours.
    Recent,
    /// Failed jobs only.
    Failed,
    #[default]
    All,
}

impl std::str::FromStr for QueryTab {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent" => Ok(QueryTab::Recent),
            "failed" => Ok(QueryTab::Failed),
            "all" => Ok(QueryTab::All),
            other => Err(format!("unknown tab: {other}")),
        }
    }
}

/// Filter for [`JobStore::query`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub pipeline_id: Option<String>,
    pub status: Option<JobStatus>,
    pub tab: Option<QueryTab>,
}

/// Per-status job counts for one pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Durable mapping `job id -> job record` over a single sqlite file.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Sqlx(sqlx::Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("creating {}: {e}", parent.display()),
                    )))
                })?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                data_json TEXT,
                result_json TEXT,
                error_json TEXT,
                git_json TEXT,
                progress REAL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_status_created
             ON jobs(pipeline_id, status, created_at DESC)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a new job. Fails with [`StoreError::DuplicateId`] when the id
    /// is already taken.
    pub async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (
                id, pipeline_id, status, created_at, started_at, completed_at,
                data_json, result_json, error_json, git_json, progress
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.pipeline_id)
        .bind(job.status.as_str())
        .bind(fmt_millis(job.created_at))
        .bind(job.started_at.map(fmt_millis))
        .bind(job.completed_at.map(fmt_millis))
        .bind(encode_json(&job.data))
        .bind(encode_json(&job.result))
        .bind(encode_json(&job.error))
        .bind(encode_json(&job.git))
        .bind(job.progress)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Apply a partial update atomically. Status changes are validated
    /// against the lifecycle DAG; anything off the DAG is rejected without
    /// touching the row.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut job = match row {
            Some(row) => job_from_row(&row)?,
            None => return Err(StoreError::NotFound(id.to_string())),
        };

        if let Some(next) = patch.status {
            if !job.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: job.status.as_str(),
                    to: next.as_str(),
                });
            }
            job.status = next;
        }
        if let Some(started_at) = patch.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
            job.error = None;
        }
        if let Some(error) = patch.error {
            job.error = Some(error);
            job.result = None;
        }
        if let Some(git) = patch.git {
            job.git = Some(git);
        }
        if let Some(progress) = patch.progress {
            job.progress = Some(progress.clamp(0.0, 1.0));
        }

        sqlx::query(
            "UPDATE jobs SET
                status = ?, started_at = ?, completed_at = ?,
                result_json = ?, error_json = ?, git_json = ?, progress = ?
             WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(job.started_at.map(fmt_millis))
        .bind(job.completed_at.map(fmt_millis))
        .bind(encode_json(&job.result))
        .bind(encode_json(&job.error))
        .bind(encode_json(&job.git))
        .bind(job.progress)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Per-status counts for one pipeline.
    pub async fn count_by_status(&self, pipeline_id: &str) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs WHERE pipeline_id = ? GROUP BY status",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "queued" => counts.queued = n,
                "running" => counts.running = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                "cancelled" => counts.cancelled = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Most recently created job for a pipeline, if any.
    pub async fn last_job(&self, pipeline_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE pipeline_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// `completed_at` of the most recent terminal job for a pipeline.
    pub async fn last_run(&self, pipeline_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT MAX(completed_at) FROM jobs
             WHERE pipeline_id = ? AND completed_at IS NOT NULL",
        )
        .bind(pipeline_id)
        .fetch_one(&self.pool)
        .await?;
        raw.map(|raw| parse_ts(&raw, "completed_at", pipeline_id))
            .transpose()
    }

    /// Paginated query with a total count, both from one snapshot.
    pub async fn query(
        &self,
        filter: &JobQuery,
        page: &ValidatedPageArgs,
    ) -> Result<(Vec<Job>, i64), StoreError> {
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(pipeline_id) = &filter.pipeline_id {
            clauses.push("pipeline_id = ?");
            binds.push(pipeline_id.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(status.as_str().to_string());
        }
        match filter.tab.unwrap_or_default() {
            QueryTab::Recent => {
                clauses.push("created_at >= ?");
                binds.push(fmt_millis(Utc::now() - chrono::Duration::hours(24)));
            }
            QueryTab::Failed => {
                clauses.push("status = ?");
                binds.push(JobStatus::Failed.as_str().to_string());
            }
            QueryTab::All => {}
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut tx = self.pool.begin().await?;

        let count_sql = format!("SELECT COUNT(*) FROM jobs{where_sql}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total = count_query.fetch_one(&mut *tx).await?;

        let page_sql =
            format!(
                "SELECT * FROM jobs{where_sql} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
            );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = page_query.bind(bind);
        }
        let rows = page_query
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// Distinct pipeline ids present in the store.
    pub async fn list_pipeline_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT pipeline_id FROM jobs ORDER BY pipeline_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn encode_json<T: Serialize>(value: &Option<T>) -> Option<String> {
    value
        .as_ref()
        .and_then(|value| serde_json::to_string(value).ok())
}

fn decode_json<T: DeserializeOwned>(
    raw: Option<String>,
    id: &str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|_| StoreError::Corrupt {
            id: id.to_string(),
            column,
        })
    })
    .transpose()
}

fn parse_ts(raw: &str, column: &'static str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            id: id.to_string(),
            column,
        })
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status.parse().map_err(|_| StoreError::Corrupt {
        id: id.clone(),
        column: "status",
    })?;

    let created_at: String = row.try_get("created_at")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Job {
        pipeline_id: row.try_get("pipeline_id")?,
        status,
        created_at: parse_ts(&created_at, "created_at", &id)?,
        started_at: started_at
            .map(|raw| parse_ts(&raw, "started_at", &id))
            .transpose()?,
        completed_at: completed_at
            .map(|raw| parse_ts(&raw, "completed_at", &id))
            .transpose()?,
        data: decode_json(row.try_get("data_json")?, &id, "data_json")?,
        result: decode_json(row.try_get("result_json")?, &id, "result_json")?,
        error: decode_json(row.try_get("error_json")?, &id, "error_json")?,
        git: decode_json(row.try_get("git_json")?, &id, "git_json")?,
        progress: row.try_get("progress")?,
        id,
    })
}
