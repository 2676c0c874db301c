//! Scan endpoints: start one or many repository scans and poll them.
//!
//! Bodies are parsed by hand so malformed requests always come back as a
//! structured 400 instead of the framework's rejection shape.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::time::{fmt_millis, now_millis};
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
struct StartScanRequest {
    repository_path: String,
    #[serde(default)]
    options: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StartMultiScanRequest {
    repository_paths: Vec<String>,
    #[serde(default)]
    options: Option<Value>,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

/// `POST /api/scans/start` -> 201 with the new job's coordinates.
pub async fn start_scan_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: StartScanRequest = parse_body(body)?;
    if request.repository_path.trim().is_empty() {
        return Err(ApiError::BadRequest("repository_path must not be empty".into()));
    }

    let worker = state.scan_worker()?;
    let job = worker
        .submit(
            None,
            json!({
                "repository_path": request.repository_path,
                "options": request.options,
            }),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_id": job.id,
            "status_url": format!("/api/scans/{}/status", job.id),
            "results_url": format!("/api/scans/{}/results", job.id),
            "message": "scan queued",
            "timestamp": now_millis(),
        })),
    ))
}

/// `POST /api/scans/start-multi` -> 201, one job per repository.
pub async fn start_scan_multi_handler(
    Extension(state): Extension<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: StartMultiScanRequest = parse_body(body)?;
    if request.repository_paths.is_empty() {
        return Err(ApiError::BadRequest("repository_paths must not be empty".into()));
    }
    if request.repository_paths.iter().any(|p| p.trim().is_empty()) {
        return Err(ApiError::BadRequest("repository_paths entries must not be empty".into()));
    }

    let worker = state.scan_worker()?;
    let mut job_ids = Vec::with_capacity(request.repository_paths.len());
    for path in &request.repository_paths {
        let job = worker
            .submit(
                None,
                json!({
                    "repository_path": path,
                    "options": request.options,
                }),
            )
            .await?;
        job_ids.push(job.id);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_ids": job_ids,
            "repository_count": request.repository_paths.len(),
            "message": "scans queued",
            "timestamp": now_millis(),
        })),
    ))
}

/// `GET /api/scans/:job_id/status`
pub async fn scan_status_handler(
    Path(job_id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get(&job_id).await?;
    Ok(Json(json!({
        "job_id": job.id,
        "pipeline_id": job.pipeline_id,
        "status": job.status,
        "progress": job.progress,
        "created_at": fmt_millis(job.created_at),
        "started_at": job.started_at.map(fmt_millis),
        "completed_at": job.completed_at.map(fmt_millis),
        "error": job.error,
        "timestamp": now_millis(),
    })))
}

/// `GET /api/scans/:job_id/results`
pub async fn scan_results_handler(
    Path(job_id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get(&job_id).await?;
    Ok(Json(json!({
        "job_id": job.id,
        "status": job.status,
        "result": job.result,
        "error": job.error,
        "timestamp": now_millis(),
    })))
}
