//! HTTP gateway tests against a live server on an ephemeral port.

mod common;

use serde_json::{json, Value};

use server_core::kernel::jobs::JobStatus;
use server_core::pipelines::scan::PIPELINE_ID;

use common::{scan_state, seed_terminal_job, spawn_app, wait_for_status};

async fn get_json(url: &str) -> (u16, Value) {
    let response = reqwest::get(url).await.expect("request");
    let status = response.status().as_u16();
    (status, response.json().await.expect("json body"))
}

#[tokio::test]
async fn health_answers_with_status_and_timestamp() {
    let addr = spawn_app(scan_state().await).await;
    let (status, body) = get_json(&format!("http://{addr}/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn status_succeeds_on_an_empty_system() {
    let addr = spawn_app(scan_state().await).await;
    let (status, body) = get_json(&format!("http://{addr}/api/status")).await;
    assert_eq!(status, 200);
    assert_eq!(body["pipelines"], json!([]));
    assert_eq!(body["recent_activity"], json!([]));
    assert_eq!(body["queue"]["active"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn status_reports_exact_pipeline_counts() {
    let state = scan_state().await;

    for i in 0..201 {
        seed_terminal_job(&state.store, &format!("r{i}"), "repomix", true).await;
    }
    for i in 0..10 {
        seed_terminal_job(&state.store, &format!("d{i}"), "duplicate-detection", true).await;
    }
    for i in 0..2 {
        seed_terminal_job(&state.store, &format!("df{i}"), "duplicate-detection", false).await;
    }

    let addr = spawn_app(state).await;
    let (status, body) = get_json(&format!("http://{addr}/api/status")).await;
    assert_eq!(status, 200);

    let pipelines = body["pipelines"].as_array().expect("pipelines array");
    assert_eq!(pipelines.len(), 2);
    // Deterministic order: sorted by id.
    assert_eq!(pipelines[0]["id"], "duplicate-detection");
    assert_eq!(pipelines[0]["completed_jobs"], 10);
    assert_eq!(pipelines[0]["failed_jobs"], 2);
    assert_eq!(pipelines[0]["status"], "idle");
    assert_eq!(pipelines[1]["id"], "repomix");
    assert_eq!(pipelines[1]["completed_jobs"], 201);
    assert_eq!(pipelines[1]["failed_jobs"], 0);
    assert_eq!(pipelines[1]["status"], "idle");
}

#[tokio::test]
async fn pipeline_jobs_paginate_with_total_and_has_more() {
    let state = scan_state().await;
    for i in 0..150 {
        seed_terminal_job(&state.store, &format!("j{i:03}"), "p", true).await;
    }

    let addr = spawn_app(state).await;
    let (status, body) = get_json(&format!(
        "http://{addr}/api/pipelines/p/jobs?limit=50&offset=100"
    ))
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["pipeline_id"], "p");
    assert_eq!(body["total"], 150);
    assert_eq!(body["jobs"].as_array().expect("jobs").len(), 50);
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn oversized_limits_are_clamped_and_bad_limits_rejected() {
    let state = scan_state().await;
    seed_terminal_job(&state.store, "j1", "p", true).await;
    let addr = spawn_app(state).await;

    let (status, _) = get_json(&format!("http://{addr}/api/jobs?limit=5000")).await;
    assert_eq!(status, 200);

    let (status, body) = get_json(&format!("http://{addr}/api/jobs?limit=0")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "bad_request");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn unknown_status_filter_is_a_400() {
    let addr = spawn_app(scan_state().await).await;
    let (status, body) = get_json(&format!("http://{addr}/api/jobs?status=paused")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn global_jobs_listing_spans_pipelines() {
    let state = scan_state().await;
    seed_terminal_job(&state.store, "a", "repomix", true).await;
    seed_terminal_job(&state.store, "b", "duplicate-detection", false).await;

    let addr = spawn_app(state).await;
    let (status, body) = get_json(&format!("http://{addr}/api/jobs")).await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 2);
    assert!(body.get("pipeline_id").is_none());

    let (_, failed) = get_json(&format!("http://{addr}/api/jobs?status=failed")).await;
    assert_eq!(failed["total"], 1);
}

#[tokio::test]
async fn scan_start_returns_201_and_runs_to_completion() {
    let state = scan_state().await;
    let store = state.store.clone();
    let addr = spawn_app(state).await;

    let repo = tempfile::tempdir().expect("tempdir");
    std::fs::write(repo.path().join("main.rs"), "fn main() {}").expect("fixture");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/scans/start"))
        .json(&json!({"repository_path": repo.path()}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.expect("json");
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    assert_eq!(body["status_url"], format!("/api/scans/{job_id}/status"));

    wait_for_status(&store, &job_id, JobStatus::Completed).await;

    let (status, results) =
        get_json(&format!("http://{addr}/api/scans/{job_id}/results")).await;
    assert_eq!(status, 200);
    assert_eq!(results["status"], "completed");
    assert_eq!(results["result"]["file_count"], 1);

    let (status, poll) = get_json(&format!("http://{addr}/api/scans/{job_id}/status")).await;
    assert_eq!(status, 200);
    assert_eq!(poll["pipeline_id"], PIPELINE_ID);
    assert_eq!(poll["progress"], 1.0);
}

#[tokio::test]
async fn scan_start_multi_reports_repository_count() {
    let state = scan_state().await;
    let addr = spawn_app(state).await;

    let a = tempfile::tempdir().expect("tempdir");
    let b = tempfile::tempdir().expect("tempdir");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/scans/start-multi"))
        .json(&json!({"repository_paths": [a.path(), b.path()]}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["repository_count"], 2);
    assert_eq!(body["job_ids"].as_array().expect("ids").len(), 2);
}

#[tokio::test]
async fn malformed_scan_bodies_are_rejected_with_400() {
    let addr = spawn_app(scan_state().await).await;
    let client = reqwest::Client::new();

    for body in [json!({}), json!({"repository_path": ""}), json!({"repository_paths": []})] {
        let url = if body.get("repository_paths").is_some() {
            format!("http://{addr}/api/scans/start-multi")
        } else {
            format!("http://{addr}/api/scans/start")
        };
        let response = client.post(url).json(&body).send().await.expect("request");
        assert_eq!(response.status().as_u16(), 400, "body: {body}");
        let err: Value = response.json().await.expect("json");
        assert_eq!(err["error"], "bad_request");
        assert!(err["timestamp"].is_string());
    }
}

#[tokio::test]
async fn scan_of_a_missing_path_fails_with_filesystem_error() {
    let state = scan_state().await;
    let store = state.store.clone();
    let addr = spawn_app(state).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/scans/start"))
        .json(&json!({"repository_path": "/definitely/not/here"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.expect("json");
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let failed = wait_for_status(&store, &job_id, JobStatus::Failed).await;
    let failure = failed.error.expect("error");
    assert_eq!(serde_json::to_value(failure.category).unwrap(), "filesystem");
}

#[tokio::test]
async fn unknown_scan_job_is_a_404() {
    let addr = spawn_app(scan_state().await).await;
    let (status, body) = get_json(&format!("http://{addr}/api/scans/ghost/status")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn ws_status_is_not_shadowed_by_scan_routes() {
    let addr = spawn_app(scan_state().await).await;
    let (status, body) = get_json(&format!("http://{addr}/ws/status")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 0);
}
