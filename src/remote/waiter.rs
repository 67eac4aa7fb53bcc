// ABOUTME: Generic convergence loop: re-read a resource until a predicate holds
// ABOUTME: Stops early on a terminal failure state and times out naming the last observed state

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use super::client::RemoteClient;
use super::models::{Instance, Network, Router, SshKey, Vm, Volume};
use crate::error::{ApiError, Result};

pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(300);

/// An observed resource that can be waited on.
pub trait Snapshot: Send {
    /// Lifecycle label used in logs and timeout errors.
    fn state_label(&self) -> String;

    /// A state the resource will never leave on its own.
    fn is_failed(&self) -> bool {
        false
    }
}

/// Source of fresh snapshots for one resource.
#[async_trait]
pub trait Probe: Send + Sync {
    type Output: Snapshot;

    /// Human name of the resource, e.g. `network 5f0c...`.
    fn target(&self) -> String;

    /// `Ok(None)` when the resource is not visible yet and polling should go on.
    async fn observe(&self) -> Result<Option<Self::Output>>;
}

/// Reads `GET <endpoint>` and decodes it as `T`.
pub struct EndpointProbe<'a, T> {
    client: &'a RemoteClient,
    endpoint: String,
    label: String,
    missing_is_pending: bool,
    _snapshot: PhantomData<fn() -> T>,
}

impl<'a, T> EndpointProbe<'a, T> {
    pub fn new(client: &'a RemoteClient, label: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            label: label.into(),
            missing_is_pending: false,
            _snapshot: PhantomData,
        }
    }

    /// Treat 404 as "not visible yet" instead of failing. For pre-condition waits on
    /// resources that were just created elsewhere.
    pub fn missing_is_pending(mut self) -> Self {
        self.missing_is_pending = true;
        self
    }
}

#[async_trait]
impl<T> Probe for EndpointProbe<'_, T>
where
    T: Snapshot + DeserializeOwned + 'static,
{
    type Output = T;

    fn target(&self) -> String {
        self.label.clone()
    }

    async fn observe(&self) -> Result<Option<T>> {
        match self.client.get_json::<T>(&self.endpoint, &[], "resource snapshot").await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if self.missing_is_pending && e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl RemoteClient {
    /// Poll `probe` until `ready` holds and return the snapshot that satisfied it.
    ///
    /// A zero `timeout` means [`DEFAULT_CONVERGENCE_TIMEOUT`]. The deadline is fixed when the
    /// call starts.
    pub async fn wait_until<P, F>(&self, probe: &P, timeout: Duration, ready: F) -> Result<P::Output>
    where
        P: Probe,
        F: Fn(&P::Output) -> bool + Send + Sync,
    {
        let timeout = if timeout.is_zero() {
            DEFAULT_CONVERGENCE_TIMEOUT
        } else {
            timeout
        };
        let deadline = Instant::now() + timeout;
        let interval = self.config().timeouts.convergence_interval;
        let mut last_state = String::from("not observed");

        loop {
            match self.guard(probe.observe()).await? {
                Some(snapshot) => {
                    if ready(&snapshot) {
                        return Ok(snapshot);
                    }
                    last_state = snapshot.state_label();
                    if snapshot.is_failed() {
                        return Err(ApiError::ResourceFailed {
                            resource: probe.target(),
                            state: last_state,
                        });
                    }
                }
                None => last_state = String::from("not found"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ApiError::Timeout {
                    target: probe.target(),
                    last_state,
                });
            }

            debug!(target = %probe.target(), state = %last_state, "Waiting for convergence");
            self.pause(jittered(interval).min(deadline - now)).await?;
        }
    }
}

/// Add up to 10% random jitter to a poll interval.
fn jittered(interval: Duration) -> Duration {
    let spread = interval.as_millis() as u64 / 10;
    if spread == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

impl Snapshot for SshKey {
    fn state_label(&self) -> String {
        if self.id > 0 {
            "visible".to_string()
        } else {
            "empty".to_string()
        }
    }
}

impl Snapshot for Network {
    fn state_label(&self) -> String {
        if self.servers_count > 0 {
            format!("{} ({} servers attached)", self.status, self.servers_count)
        } else {
            self.status.clone()
        }
    }

    fn is_failed(&self) -> bool {
        self.status == "error"
    }
}

impl Snapshot for Router {
    fn state_label(&self) -> String {
        self.status.clone()
    }

    fn is_failed(&self) -> bool {
        self.status == "error"
    }
}

impl Snapshot for Vm {
    fn state_label(&self) -> String {
        if self.state.is_empty() {
            self.status.clone()
        } else {
            self.state.clone()
        }
    }

    fn is_failed(&self) -> bool {
        self.state == "error" || self.status == "error"
    }
}

impl Snapshot for Volume {
    fn state_label(&self) -> String {
        self.state.clone()
    }

    fn is_failed(&self) -> bool {
        self.state == "error"
    }
}

impl Snapshot for Instance {
    fn state_label(&self) -> String {
        match (&self.status, self.create_status) {
            (Some(s), _) if !s.is_empty() => s.clone(),
            (_, Some(cs)) => format!("create_status {}", cs),
            _ if self.running => "running".to_string(),
            _ => "stopped".to_string(),
        }
    }

    fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::config::{ClientConfig, Timeouts};

    #[derive(Debug, Clone, PartialEq)]
    struct Fake {
        seq: usize,
        state: &'static str,
    }

    impl Snapshot for Fake {
        fn state_label(&self) -> String {
            self.state.to_string()
        }
        fn is_failed(&self) -> bool {
            self.state == "error"
        }
    }

    /// Replays a scripted list of observations, repeating the last one.
    struct Scripted {
        script: Vec<Option<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for Scripted {
        type Output = Fake;
        fn target(&self) -> String {
            "widget 9".to_string()
        }
        async fn observe(&self) -> Result<Option<Fake>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script[n.min(self.script.len() - 1)];
            Ok(step.map(|state| Fake { seq: n, state }))
        }
    }

    fn client() -> RemoteClient {
        let timeouts = Timeouts {
            convergence_interval: Duration::from_millis(5),
            ..Timeouts::default()
        };
        RemoteClient::new(Arc::new(
            ClientConfig::new("http://127.0.0.1:9", "t").with_timeouts(timeouts),
        ))
        .unwrap()
    }

    fn scripted(script: Vec<Option<&'static str>>) -> Scripted {
        Scripted {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_returns_exact_snapshot_that_satisfied_predicate() {
        let probe = scripted(vec![Some("queued"), Some("active"), Some("active")]);
        let got = client()
            .wait_until(&probe, Duration::from_secs(5), |s: &Fake| s.state == "active")
            .await
            .unwrap();
        assert_eq!(got, Fake { seq: 1, state: "active" });
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_state_stops_immediately() {
        let probe = scripted(vec![Some("queued"), Some("error")]);
        let err = client()
            .wait_until(&probe, Duration::from_secs(5), |s: &Fake| s.state == "active")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ResourceFailed { ref state, .. } if state == "error"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_names_target_and_last_state() {
        let probe = scripted(vec![Some("provision_queued")]);
        let err = client()
            .wait_until(&probe, Duration::from_millis(40), |s: &Fake| s.state == "active")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("widget 9"), "{msg}");
        assert!(msg.contains("provision_queued"), "{msg}");
    }

    #[tokio::test]
    async fn test_missing_then_present() {
        let probe = scripted(vec![None, None, Some("active")]);
        let got = client()
            .wait_until(&probe, Duration::from_secs(5), |s: &Fake| s.state == "active")
            .await
            .unwrap();
        assert_eq!(got.seq, 2);
    }

    #[tokio::test]
    async fn test_timeout_while_missing_reports_not_found() {
        let probe = scripted(vec![None]);
        let err = client()
            .wait_until(&probe, Duration::from_millis(30), |_: &Fake| true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let c = client();
        let token = c.cancellation().clone();
        let probe = scripted(vec![Some("queued")]);
        let handle = tokio::spawn(async move {
            c.wait_until(&probe, Duration::from_secs(60), |s: &Fake| s.state == "active")
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(ApiError::Cancelled)));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let j = jittered(base);
            assert!(j >= base && j <= base + Duration::from_millis(100));
        }
        assert_eq!(jittered(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn test_network_label_mentions_attached_servers() {
        let n = Network {
            status: "active".into(),
            servers_count: 2,
            ..Default::default()
        };
        assert_eq!(n.state_label(), "active (2 servers attached)");
    }
}
