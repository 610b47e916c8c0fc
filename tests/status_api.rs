// tests/status_api.rs
//
// Status router exercised in-process via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /status reflects watch-channel snapshots
// - /metrics is only mounted when a recorder handle is given

use axum::body::{self, Body};
use http::{Request, StatusCode};
use serde_json::Value as Json;
use tokio::sync::watch;
use tower::ServiceExt as _;

use epg_orchestrator::scheduler::{SchedulePhase, ScheduleState};
use epg_orchestrator::status::{create_router, AppState};
use epg_orchestrator::supervisor::{SupervisorState, SupervisorStatus};

const BODY_LIMIT: usize = 1024 * 1024;

async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, String::from_utf8(bytes).expect("utf8"))
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, body) = get(create_router(AppState::default(), None), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.trim(), "OK");
}

#[tokio::test]
async fn status_reports_current_snapshots() {
    let (sup_tx, sup_rx) = watch::channel(SupervisorStatus::default());
    let (sched_tx, sched_rx) = watch::channel(ScheduleState::default());
    let app = create_router(
        AppState {
            supervisor: Some(sup_rx),
            scheduler: Some(sched_rx),
        },
        None,
    );

    sup_tx.send_modify(|s| {
        s.state = SupervisorState::Crashed;
        s.restart_count = 3;
        s.persistent_failure = true;
    });
    sched_tx.send_modify(|s| {
        s.phase = SchedulePhase::Backoff;
        s.cycles = 7;
        s.consecutive_failures = 2;
    });

    let (status, body) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).expect("json body");
    assert_eq!(v["supervisor"]["state"], "crashed");
    assert_eq!(v["supervisor"]["restart_count"], 3);
    assert_eq!(v["supervisor"]["persistent_failure"], true);
    assert_eq!(v["scheduler"]["phase"], "backoff");
    assert_eq!(v["scheduler"]["cycles"], 7);
    assert_eq!(v["scheduler"]["consecutive_failures"], 2);
}

#[tokio::test]
async fn status_without_proxy_reports_null_supervisor() {
    let (_tx, rx) = watch::channel(ScheduleState::default());
    let app = create_router(
        AppState {
            supervisor: None,
            scheduler: Some(rx),
        },
        None,
    );
    let (_, body) = get(app, "/status").await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert!(v["supervisor"].is_null());
    assert_eq!(v["scheduler"]["phase"], "idle");
}

#[tokio::test]
async fn metrics_route_absent_without_recorder() {
    let (status, _) = get(create_router(AppState::default(), None), "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
