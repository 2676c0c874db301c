//! Aggregate system status for the dashboard.

use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Value};

use crate::common::time::now_millis;
use crate::kernel::pipelines::compose_status;
use crate::server::app::AppState;
use crate::server::error::ApiError;

/// `GET /api/status`
///
/// Succeeds (with empty arrays) even when no job has ever run.
pub async fn status_handler(Extension(state): Extension<AppState>) -> Result<Json<Value>, ApiError> {
    let pipelines = compose_status(&state.store).await?;

    let mut active = 0usize;
    let mut queued = 0usize;
    let mut capacity = 0usize;
    for worker in state.workers.values() {
        let metrics = worker.metrics();
        active += metrics.active;
        queued += metrics.queued;
        capacity += metrics.max_concurrent;
    }
    let capacity_pct = if capacity == 0 {
        0.0
    } else {
        (active as f64 / capacity as f64) * 100.0
    };

    let retry_metrics = state.retry.metrics();
    let recent_activity = state.activity.recent(20);

    Ok(Json(json!({
        "timestamp": now_millis(),
        "environment": state.environment,
        "pipelines": pipelines,
        "queue": {
            "active": active,
            "queued": queued,
            "capacity_pct": capacity_pct,
        },
        "retry_metrics": retry_metrics,
        "recent_activity": recent_activity,
    })))
}
