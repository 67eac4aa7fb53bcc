// ABOUTME: Drives an asynchronous backend job to a terminal status
// ABOUTME: A 404 on the status fetch means the job record is not published yet and is retried

use std::time::Duration;

use reqwest::Method;
use tracing::{debug, info};

use super::client::{RemoteClient, RequestTarget};
use super::models::{JobHandle, JobStatus, JobStatusResponse};
use super::JOBS_EP;
use crate::error::{ApiError, Result};

pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

impl RemoteClient {
    pub async fn get_job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let endpoint;
        let target = match handle {
            JobHandle::StatusUrl(url) => RequestTarget::Url(url),
            JobHandle::JobId(id) => {
                endpoint = format!("{}/{}", JOBS_EP, id);
                RequestTarget::Endpoint(&endpoint)
            }
        };

        let response = self
            .execute::<()>(Method::GET, target, &[], None)
            .await?;

        let envelope: JobStatusResponse = serde_json::from_slice(&response.body)
            .map_err(|source| ApiError::Decode {
                what: "job status",
                source,
            })?;

        if let Some(status) = envelope.data {
            return Ok(status);
        }
        if envelope.ok == Some(false) {
            let err = envelope.error.unwrap_or_default();
            return Err(ApiError::Rejected {
                message: err
                    .text()
                    .unwrap_or("job status request rejected")
                    .to_string(),
                code: err.code,
            });
        }
        serde_json::from_slice(&response.body).map_err(|source| ApiError::Decode {
            what: "job status",
            source,
        })
    }

    /// Poll `handle` until the job is terminal.
    ///
    /// Imposes no deadline of its own: wrap it in a timeout or cancel the client. Only a 404
    /// is retried; any other failure aborts immediately. An error-flagged terminal status is
    /// returned as `Ok` and left to the caller to interpret.
    pub async fn poll_until_complete(
        &self,
        handle: &JobHandle,
        interval: Duration,
        mut on_update: impl FnMut(&JobStatus) + Send,
    ) -> Result<JobStatus> {
        let interval = if interval.is_zero() {
            DEFAULT_JOB_POLL_INTERVAL
        } else {
            interval
        };

        loop {
            match self.get_job_status(handle).await {
                Ok(status) => {
                    on_update(&status);
                    if status.is_terminal() {
                        info!(
                            job = %handle.label(),
                            status = %status.status,
                            error = status.error,
                            "Job reached terminal state"
                        );
                        return Ok(status);
                    }
                    debug!(
                        job = %handle.label(),
                        status = %status.status,
                        progress = status.progress,
                        "Job still running"
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!(job = %handle.label(), "Job record not visible yet");
                }
                Err(e) => return Err(e),
            }

            self.pause(interval).await?;
        }
    }

    /// [`poll_until_complete`](Self::poll_until_complete) bounded by `timeout`. The timeout
    /// error names the job and the last status seen.
    pub async fn await_job(
        &self,
        handle: &JobHandle,
        interval: Duration,
        timeout: Duration,
    ) -> Result<JobStatus> {
        let mut last_state = String::from("not visible");
        let outcome = tokio::time::timeout(
            timeout,
            self.poll_until_complete(handle, interval, |s| {
                last_state = format!("{} ({}%)", s.status, s.progress);
            }),
        )
        .await;

        match outcome {
            Ok(res) => res,
            Err(_) => Err(ApiError::Timeout {
                target: handle.label(),
                last_state,
            }),
        }
    }
}
