// ABOUTME: Shared create/update/delete building blocks for every resource kind
// ABOUTME: Submit with bounded retry, resolve jobs, converge, and treat missing targets as deleted

pub mod instance;
pub mod network;
pub mod router;
pub mod ssh_key;
pub mod vm;
pub mod volume;

use std::fmt;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::remote::models::SubmitResponse;
use crate::remote::{JobHandle, JobStatus, RemoteClient, RequestTarget, ResponseEnvelope};

pub use instance::{InstanceReconciler, InstanceSpec, InstanceState};
pub use network::{NetworkReconciler, NetworkSpec, NetworkState, NetworkType};
pub use router::{RouterReconciler, RouterSpec, RouterState};
pub use ssh_key::{SshKeyReconciler, SshKeySpec, SshKeyState};
pub use vm::{VmReconciler, VmSpec, VmState};
pub use volume::{VolumeReconciler, VolumeSpec};

/// The four entry points a declarative framework drives per resource kind. The framework
/// persists `Observed` and diffs it against the next `Desired`; nothing here stores state.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Clone + Send + Sync;
    type Id: Clone + fmt::Display + Send + Sync;

    fn id_of(observed: &Self::Observed) -> Self::Id;

    /// Copy fields the API never returns (local-only or write-only) from `previous` into a
    /// freshly read snapshot.
    fn carry_local(_previous: &Self::Observed, _fresh: &mut Self::Observed) {}

    async fn create(&self, desired: &Self::Desired) -> Result<Self::Observed>;

    /// `Ok(None)` when the resource no longer exists.
    async fn read(&self, id: &Self::Id) -> Result<Option<Self::Observed>>;

    async fn update(
        &self,
        desired: &Self::Desired,
        previous: &Self::Observed,
    ) -> Result<Self::Observed>;

    /// Succeeds when the resource is already gone.
    async fn delete(&self, id: &Self::Id) -> Result<()>;

    /// Re-read a previously observed resource, keeping its local-only fields.
    async fn refresh(&self, previous: &Self::Observed) -> Result<Option<Self::Observed>> {
        let mut fresh = match self.read(&Self::id_of(previous)).await? {
            Some(fresh) => fresh,
            None => return Ok(None),
        };
        Self::carry_local(previous, &mut fresh);
        Ok(Some(fresh))
    }
}

/// A submission after its job (if any) has finished successfully.
#[derive(Debug)]
pub(crate) struct Submitted {
    pub response: ResponseEnvelope,
    pub job: Option<JobStatus>,
    pub job_label: Option<String>,
}

impl Submitted {
    pub fn body<T: DeserializeOwned>(&self, what: &'static str) -> Result<T> {
        self.response.json(what)
    }
}

/// POST once; the response must not be an `ok: false` envelope.
pub(crate) async fn submit<P: Serialize + Sync + ?Sized>(
    client: &RemoteClient,
    endpoint: &str,
    payload: &P,
) -> Result<ResponseEnvelope> {
    let response = client.post(endpoint, payload).await?;
    if let Ok(envelope) = serde_json::from_slice::<SubmitResponse>(&response.body) {
        envelope.check()?;
    }
    Ok(response)
}

/// POST, resubmitting while the failure is transient (a prerequisite the backend has not
/// indexed yet) and the enqueue window is open.
pub(crate) async fn submit_with_retry<P: Serialize + Sync + ?Sized>(
    client: &RemoteClient,
    endpoint: &str,
    payload: &P,
) -> Result<ResponseEnvelope> {
    let timeouts = &client.config().timeouts;
    let deadline = Instant::now() + timeouts.enqueue_window;
    let mut attempt = 1u32;

    loop {
        match submit(client, endpoint, payload).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && Instant::now() < deadline => {
                warn!(
                    endpoint,
                    attempt,
                    error = %e,
                    "Prerequisite not visible yet, resubmitting"
                );
                attempt += 1;
                client.pause(timeouts.enqueue_retry_interval).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// If the submission handed back a job, wait for it within the job budget and fail on an
/// error-flagged result. Otherwise the submission was synchronous.
pub(crate) async fn settle(client: &RemoteClient, response: ResponseEnvelope) -> Result<Submitted> {
    let handle = serde_json::from_slice::<SubmitResponse>(&response.body)
        .ok()
        .and_then(|s| s.job_handle());

    let Some(handle) = handle else {
        return Ok(Submitted {
            response,
            job: None,
            job_label: None,
        });
    };

    let status = resolve_job(client, &handle).await?;
    let timeouts = &client.config().timeouts;
    if !timeouts.post_job_settle.is_zero() {
        client.pause(timeouts.post_job_settle).await?;
    }
    Ok(Submitted {
        response,
        job: Some(status),
        job_label: Some(handle.address().to_string()),
    })
}

pub(crate) async fn resolve_job(client: &RemoteClient, handle: &JobHandle) -> Result<JobStatus> {
    let timeouts = &client.config().timeouts;
    let status = client
        .await_job(handle, timeouts.job_poll_interval, timeouts.job_wait)
        .await?;
    status.into_result(handle.address())
}

/// GET a resource; not-found means it is gone.
pub(crate) async fn read_optional<T: DeserializeOwned>(
    client: &RemoteClient,
    endpoint: &str,
    what: &'static str,
) -> Result<Option<T>> {
    match client.get_json(endpoint, &[], what).await {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// DELETE that treats an already-missing target as success.
pub(crate) async fn delete_idempotent(client: &RemoteClient, endpoint: &str, label: &str) -> Result<()> {
    match client.delete(endpoint).await {
        Ok(_) => {
            info!(resource = label, "Deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(resource = label, "Already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// POST without a body (detach-style actions).
pub(crate) async fn post_empty(client: &RemoteClient, endpoint: &str) -> Result<ResponseEnvelope> {
    client
        .execute::<()>(Method::POST, RequestTarget::Endpoint(endpoint), &[], None)
        .await
}

pub(crate) fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
