//! Job listing endpoints: per-pipeline and global.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::pagination::PageArgs;
use crate::common::time::now_millis;
use crate::kernel::jobs::{JobQuery, JobStatus, QueryTab};
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize, Default)]
pub struct JobsQueryParams {
    pub status: Option<String>,
    pub tab: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /api/pipelines/:pipeline_id/jobs`
pub async fn pipeline_jobs_handler(
    Path(pipeline_id): Path<String>,
    Query(params): Query<JobsQueryParams>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    list_jobs(&state, Some(pipeline_id), params).await
}

/// `GET /api/jobs`: the same listing across all pipelines.
pub async fn all_jobs_handler(
    Query(params): Query<JobsQueryParams>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    list_jobs(&state, None, params).await
}

async fn list_jobs(
    state: &AppState,
    pipeline_id: Option<String>,
    params: JobsQueryParams,
) -> Result<Json<Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let tab = params
        .tab
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<QueryTab>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let page = PageArgs {
        limit: params.limit,
        offset: params.offset,
    }
    .validate()
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = JobQuery {
        pipeline_id: pipeline_id.clone(),
        status,
        tab,
    };
    let (jobs, total) = state.store.query(&filter, &page).await?;
    let has_more = page.has_more(jobs.len(), total);

    let mut body = json!({
        "jobs": jobs,
        "total": total,
        "has_more": has_more,
        "timestamp": now_millis(),
    });
    if let Some(pipeline_id) = pipeline_id {
        body["pipeline_id"] = Value::String(pipeline_id);
    }
    Ok(Json(body))
}
