use axum::Json;
use serde_json::{json, Value};

use crate::common::time::now_millis;

/// Liveness probe. No auth, no dependencies, always 200.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": now_millis(),
    }))
}
