// ABOUTME: Job polling against a fake backend
// ABOUTME: 404 means "not published yet" and is retried; anything else aborts on the first failure

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use scamp_reconciler::remote::ResourceId;
use scamp_reconciler::{ApiError, JobHandle};
use support::{api, client, serve};

#[derive(Default)]
struct Counter(AtomicUsize);

impl Counter {
    fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn status_url(origin: &str, path: &str) -> JobHandle {
    JobHandle::new(Some(format!("{}{}", origin, path)), None).unwrap()
}

#[tokio::test]
async fn test_unpublished_job_is_retried_until_finished() {
    async fn job(State(c): State<Arc<Counter>>) -> Response {
        match c.next() {
            0..=2 => (StatusCode::NOT_FOUND, Json(json!({ "code": "NOT_FOUND" }))).into_response(),
            3 => Json(json!({ "ok": true, "data": { "status": "running", "progress": 50.5 } }))
                .into_response(),
            _ => Json(json!({
                "ok": true,
                "data": { "id": 42, "status": "finished", "progress": 100, "resource_id": "7" }
            }))
            .into_response(),
        }
    }

    let counter = Arc::new(Counter::default());
    let app = Router::new()
        .route("/jobs/42", get(job))
        .with_state(counter.clone());
    let origin = serve(app).await;

    let mut seen = Vec::new();
    let status = client(&origin)
        .poll_until_complete(&status_url(&origin, "/jobs/42"), Duration::from_millis(5), |s| {
            seen.push(format!("{} {}", s.status, s.progress))
        })
        .await
        .unwrap();

    assert_eq!(status.status, "finished");
    assert_eq!(status.resource_id("job 42").unwrap(), ResourceId(7));
    assert_eq!(counter.get(), 5);
    assert_eq!(seen, vec!["running 50", "finished 100"]);
}

#[tokio::test]
async fn test_non_404_failure_aborts_without_retry() {
    async fn job(State(c): State<Arc<Counter>>) -> impl IntoResponse {
        c.next();
        (StatusCode::INTERNAL_SERVER_ERROR, "database on fire")
    }

    let counter = Arc::new(Counter::default());
    let app = Router::new()
        .route(&api("/tasks/abc"), get(job))
        .with_state(counter.clone());
    let origin = serve(app).await;

    let handle = JobHandle::new(None, Some("abc".into())).unwrap();
    let err = client(&origin)
        .poll_until_complete(&handle, Duration::from_millis(5), |_| {})
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_status_url_preferred_over_job_id() {
    let hits_url = Arc::new(Counter::default());
    let app = Router::new()
        .route(
            "/status/9",
            get(|State(c): State<Arc<Counter>>| async move {
                c.next();
                Json(json!({ "data": { "status": "finished" } }))
            }),
        )
        .with_state(hits_url.clone());
    let origin = serve(app).await;

    // Only the status URL route exists; a poll by id would 404 forever.
    let handle = JobHandle::new(Some("/status/9".into()), Some("9".into())).unwrap();
    let status = client(&origin)
        .await_job(&handle, Duration::from_millis(5), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(status.status, "finished");
    assert_eq!(hits_url.get(), 1);
}

#[tokio::test]
async fn test_error_flag_becomes_domain_failure() {
    let app = Router::new().route(
        "/jobs/1",
        get(|| async {
            Json(json!({
                "ok": true,
                "data": { "status": "failed", "progress": 30, "error": true, "error_data": "quota exceeded" }
            }))
        }),
    );
    let origin = serve(app).await;

    let handle = status_url(&origin, "/jobs/1");
    let status = client(&origin)
        .await_job(&handle, Duration::from_millis(5), Duration::from_secs(2))
        .await
        .unwrap();
    let err = status.into_result(handle.address()).unwrap_err();
    assert!(matches!(err, ApiError::JobFailed { ref detail, .. } if detail == "quota exceeded"));
    assert_eq!(err.class(), scamp_reconciler::ErrorClass::Domain);
}

#[tokio::test]
async fn test_await_job_timeout_reports_last_status() {
    let app = Router::new().route(
        "/jobs/2",
        get(|| async { Json(json!({ "data": { "status": "running", "progress": 40 } })) }),
    );
    let origin = serve(app).await;

    let err = client(&origin)
        .await_job(
            &status_url(&origin, "/jobs/2"),
            Duration::from_millis(5),
            Duration::from_millis(60),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Timeout { .. }), "{err:?}");
    assert!(err.to_string().contains("running (40%)"), "{err}");
}
