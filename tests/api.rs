//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use dca_server::api::{self, ApiState};
use dca_server::db::{self, DatakitRecord, DatakitRepo, DatakitStatus};
use dca_server::{Registry, RegistrySettings};

fn build_test_router() -> (axum::Router, DatakitRepo) {
    let pool = db::init_memory().unwrap();
    let repo = DatakitRepo::new(pool);
    let registry = Registry::spawn(
        repo.clone(),
        RegistrySettings::default(),
        TaskTracker::new(),
        CancellationToken::new(),
    );
    let state = Arc::new(ApiState {
        registry,
        repo: repo.clone(),
    });
    (api::router(state), repo)
}

fn sample_record(conn_id: &str) -> DatakitRecord {
    DatakitRecord {
        conn_id: conn_id.to_string(),
        runtime_id: "rt-1".to_string(),
        workspace_uuid: "w1".to_string(),
        host_name: "host-a".to_string(),
        ip: "10.0.0.1".to_string(),
        os: "linux".to_string(),
        arch: "amd64".to_string(),
        version: "1.5.0".to_string(),
        run_mode: "normal".to_string(),
        usage_cores: 4,
        start_time: 1_700_000_000,
        run_in_container: false,
        url: String::new(),
        status: DatakitStatus::Running,
        global_host_tags: std::collections::HashMap::new(),
        updated_at: chrono::Utc::now(),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_gauge() {
    let (router, _repo) = build_test_router();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["live_connections"], 0);
}

#[tokio::test]
async fn list_returns_persisted_records() {
    let (router, repo) = build_test_router();
    repo.insert(&sample_record("c1")).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/datakits/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["content"][0]["conn_id"], "c1");
    assert_eq!(json["content"][0]["status"], "running");
}

#[tokio::test]
async fn get_unknown_record_is_not_found_envelope() {
    let (router, _repo) = build_test_router();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/datakits/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["errorCode"], "datakit.notFound");
}

#[tokio::test]
async fn action_on_offline_device_is_unavailable() {
    let (router, repo) = build_test_router();
    repo.insert(&sample_record("c1")).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/datakits/c1/get_datakit_stats_action")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["errorCode"], "datakit.unavailable");
}

#[tokio::test]
async fn unknown_action_name_is_rejected() {
    let (router, _repo) = build_test_router();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/datakits/c1/format_disk")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["errorCode"], "datakit.unknownAction");
}

#[tokio::test]
async fn log_tail_without_live_connection_is_unavailable() {
    let (router, repo) = build_test_router();
    repo.insert(&sample_record("c1")).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/datakits/c1/logtail")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["errorCode"], "datakit.unavailable");
}

#[tokio::test]
async fn ws_endpoint_requires_upgrade() {
    let (router, _repo) = build_test_router();

    let response = router
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}
