// ABOUTME: In-process fake backend for integration tests
// ABOUTME: Serves an axum router on an ephemeral port and builds clients with millisecond timeouts

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use scamp_reconciler::{ClientConfig, RemoteClient, Timeouts};

pub const TOKEN: &str = "test-token";
pub const API_PREFIX: &str = "/api/v1";

/// Serve `app` on 127.0.0.1 and return the origin, e.g. `http://127.0.0.1:41234`.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake backend");
    });
    format!("http://{}", addr)
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        key_visibility: Duration::from_millis(500),
        enqueue_window: Duration::from_millis(500),
        enqueue_retry_interval: Duration::from_millis(10),
        job_poll_interval: Duration::from_millis(5),
        job_wait: Duration::from_secs(2),
        post_job_settle: Duration::from_millis(1),
        network_active: Duration::from_secs(2),
        router_active: Duration::from_secs(2),
        vm_running: Duration::from_secs(2),
        vm_toggle: Duration::from_secs(2),
        volume_state: Duration::from_secs(2),
        instance_provisioned: Duration::from_secs(2),
        network_drain: Duration::from_secs(2),
        convergence_interval: Duration::from_millis(5),
    }
}

pub fn client_with(origin: &str, timeouts: Timeouts) -> RemoteClient {
    let config = ClientConfig::new(format!("{}{}", origin, API_PREFIX), TOKEN).with_timeouts(timeouts);
    RemoteClient::new(Arc::new(config)).expect("client")
}

pub fn client(origin: &str) -> RemoteClient {
    client_with(origin, fast_timeouts())
}

/// Full path of an API endpoint on the fake backend.
pub fn api(path: &str) -> String {
    format!("{}{}", API_PREFIX, path)
}
