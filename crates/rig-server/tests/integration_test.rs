//! End-to-end exercise of the five HTTP routes (spec §6.2) against a real
//! router, no mocked state. Mirrors the teacher's admin-api integration
//! test shape (`tower::util::ServiceExt::oneshot` against `create_router`)
//! but needs no database: this crate's only external dependency is the
//! local filesystem (artifact cache, scratch dirs), stood up in a tempdir
//! per test.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use rig_server::config::ServerConfig;
use rig_server::state::AppState;

fn test_config(rig_dir: std::path::PathBuf) -> ServerConfig {
    ServerConfig {
        rig_dir,
        bind_addr: "127.0.0.1:0".to_string(),
        log_format: "compact".to_string(),
        port_range_min: rig_ports::DEFAULT_MIN_PORT,
        port_range_max: rig_ports::DEFAULT_MAX_PORT,
        watchdog_stall: Duration::from_secs(30),
        refresh_interval: Duration::from_secs(3600),
        callback_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_millis(200),
    }
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_check_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = rig_server::create_router(AppState::new(test_config(dir.path().to_path_buf())));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejects_spec_with_no_services() {
    let dir = tempfile::tempdir().unwrap();
    let app = rig_server::create_router(AppState::new(test_config(dir.path().to_path_buf())));

    let body = json!({"name": "empty", "services": {}}).to_string();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/environments")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let errors = read_json(response).await;
    assert!(errors.as_array().unwrap().iter().any(|e| e.as_str().unwrap().contains("at least one service")));
}

#[tokio::test]
async fn full_create_get_delete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(test_config(dir.path().to_path_buf()));

    let body = json!({
        "name": "demo",
        "services": {
            "sidecar": {"type": "test"}
        }
    })
    .to_string();

    let create_response = rig_server::create_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/environments")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::ACCEPTED);
    let created = read_json(create_response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let get_response = rig_server::create_router(state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/environments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let environment = read_json(get_response).await;
    assert_eq!(environment["name"], "demo");
    // The synthetic `~test` root is injected alongside the client's service.
    assert!(environment["services"].as_object().unwrap().contains_key("~test"));

    let delete_response = rig_server::create_router(state.clone())
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/environments/{id}?log=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete_response.status(), StatusCode::NO_CONTENT);

    let log_path = dir.path().join("logs").join(format!("demo-{id}.jsonl"));
    assert!(log_path.exists(), "expected a JSONL log to be written on teardown");

    let missing_response = rig_server::create_router(state)
        .oneshot(
            Request::builder()
                .uri(format!("/environments/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing_response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_unknown_environment_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = rig_server::create_router(AppState::new(test_config(dir.path().to_path_buf())));

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/environments/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
