// ABOUTME: Wire shapes for job submission, job status, and per-kind resource snapshots
// ABOUTME: Nullable fields decode as Option; heterogeneous ids are normalized at this boundary

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ApiError, Result};

/// Canonical integer identifier of a backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub i64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `resource_id` or job `id` as the backend sends it: a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawId {
    /// Normalize to the canonical integer id. Fails on empty, non-numeric, fractional or
    /// non-positive values.
    pub fn canonical(&self) -> Result<ResourceId> {
        let id = match self {
            RawId::Int(n) => *n,
            RawId::Float(f) if f.fract() == 0.0 && f.is_finite() => *f as i64,
            RawId::Float(f) => return Err(ApiError::InvalidResourceId(f.to_string())),
            RawId::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ApiError::InvalidResourceId(format!("{:?}", s)))?,
        };
        if id <= 0 {
            return Err(ApiError::InvalidResourceId(id.to_string()));
        }
        Ok(ResourceId(id))
    }

    /// The id as text, for kinds addressed by UUID.
    pub fn as_text(&self) -> String {
        match self {
            RawId::Int(n) => n.to_string(),
            RawId::Float(f) => f.to_string(),
            RawId::Text(s) => s.clone(),
        }
    }
}

/// Structured error object. Either `{code, message}` or `{message, error}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|m| !m.is_empty())
    }
}

/// Response to a mutating call. Both addressing fields absent means the call was synchronous.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub job_id: Option<RawId>,
    #[serde(default)]
    pub status_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl SubmitResponse {
    pub fn job_handle(&self) -> Option<JobHandle> {
        JobHandle::new(
            self.status_url.clone(),
            self.job_id.as_ref().map(RawId::as_text),
        )
    }

    /// `Err(Rejected)` when the envelope says `ok: false`.
    pub fn check(&self) -> Result<()> {
        if self.ok == Some(false) {
            let message = self
                .error
                .as_ref()
                .and_then(|e| e.text())
                .or(self.message.as_deref())
                .unwrap_or("submission rejected without a message")
                .to_string();
            return Err(ApiError::Rejected {
                code: self.error.as_ref().and_then(|e| e.code.clone()),
                message,
            });
        }
        Ok(())
    }
}

/// How to address a job. The status URL wins when both are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobHandle {
    StatusUrl(String),
    JobId(String),
}

impl JobHandle {
    pub fn new(status_url: Option<String>, job_id: Option<String>) -> Option<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match (non_empty(status_url), non_empty(job_id)) {
            (Some(url), _) => Some(JobHandle::StatusUrl(url)),
            (None, Some(id)) => Some(JobHandle::JobId(id)),
            (None, None) => None,
        }
    }

    /// The status URL or job id as given.
    pub fn address(&self) -> &str {
        match self {
            JobHandle::StatusUrl(url) => url,
            JobHandle::JobId(id) => id,
        }
    }

    pub fn label(&self) -> String {
        match self {
            JobHandle::StatusUrl(url) => format!("job at {}", url),
            JobHandle::JobId(id) => format!("job {}", id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub data: Option<JobStatus>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "truncated_progress")]
    pub progress: i64,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_data: Option<String>,
    #[serde(default)]
    pub resource_id: Option<RawId>,
}

/// Progress arrives as an integer, a float (`33.5`), a numeric string or null; fractions are
/// truncated and anything unparseable reads as 0.
fn truncated_progress<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let raw = Option::<RawId>::deserialize(d)?;
    Ok(match raw {
        Some(RawId::Int(n)) => n,
        Some(RawId::Float(f)) if f.is_finite() => f.trunc() as i64,
        Some(RawId::Text(s)) => s.trim().parse::<f64>().map(|f| f.trunc() as i64).unwrap_or(0),
        _ => 0,
    })
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.status == "finished" || self.error || self.progress >= 100
    }

    /// Turn an error-flagged terminal status into a domain failure.
    pub fn into_result(self, job: &str) -> Result<JobStatus> {
        if self.error {
            let detail = self
                .error_data
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("job ended in status {:?}", self.status));
            return Err(ApiError::JobFailed {
                job: job.to_string(),
                detail,
            });
        }
        Ok(self)
    }

    pub fn resource_id(&self, job: &str) -> Result<ResourceId> {
        self.resource_id
            .as_ref()
            .ok_or_else(|| ApiError::MissingResourceId {
                job: job.to_string(),
            })?
            .canonical()
    }
}

/// Decode a resource that may be wrapped as `{ "ok": .., "data": {..} }` or sent bare.
pub fn decode_resource<T: DeserializeOwned>(body: &[u8], what: &'static str) -> Result<T> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|source| ApiError::Decode { what, source })?;
    let inner = match value {
        serde_json::Value::Object(mut map) if map.get("data").is_some_and(|d| d.is_object()) => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(inner).map_err(|source| ApiError::Decode { what, source })
}

// ---------------------------------------------------------------------------
// Resource snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshKey {
    pub id: i64,
    pub key_name: String,
    pub key_type: String,
    pub public_key: String,
    /// Only returned by the generate call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub fingerprint: String,
    pub has_private_key: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub network_uuid: String,
    pub name: String,
    pub cidr: String,
    pub network_type: String,
    pub status: String,
    pub router_uuid: Option<String>,
    pub servers_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Router {
    pub router_uuid: String,
    pub name: String,
    pub ipv4_address: String,
    pub ipv6_address: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmNetwork {
    pub ip_internal: String,
    pub ipv6_address: String,
    pub public_ipv4: String,
    pub public_ipv6: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vm {
    pub vm_uuid: String,
    pub vm_name: String,
    pub display_name: String,
    pub cpu_cores: i64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub vm_class_id: i64,
    pub storage_class_id: i64,
    pub network_class_id: i64,
    pub vm_template_id: i64,
    pub network_uuid: String,
    pub ssh_key_id: Option<i64>,
    pub os_user: String,
    pub status: String,
    pub state: String,
    pub protected: bool,
    pub network: Option<VmNetwork>,
    pub created_at: String,
}

/// Synchronous VM creation body. Carries the one-time password.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmCreateResponse {
    pub vm_uuid: String,
    pub vm_name: String,
    pub os_user: String,
    pub os_password: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeLimits {
    pub read_iops_limit: i64,
    pub write_iops_limit: i64,
    pub read_bandwidth_limit: i64,
    pub write_bandwidth_limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub disk_uuid: String,
    pub display_name: String,
    pub size_gb: i64,
    pub storage_class_id: i64,
    pub state: String,
    pub sds_pool_name: String,
    pub vm_uuid: Option<String>,
    pub limits: Option<VolumeLimits>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: Option<i64>,
    pub name: String,
    pub flavor_id: Option<i64>,
    pub image_id: Option<i64>,
    pub ssh_key_id: Option<i64>,
    pub running: bool,
    pub status: Option<String>,
    pub create_status: Option<i64>,
    pub os: String,
    pub distro_base: String,
    pub ipv4: String,
    pub ipv6: String,
    pub vmid: String,
    pub price_month: Option<f64>,
    pub cpus: Option<i64>,
    pub ram: Option<f64>,
    pub disk: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstanceList {
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmClass {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub cpu_cores: i64,
    pub cpu_min_usage: i64,
    pub cpu_max_usage: i64,
    pub memory_mb: i64,
    pub price_per_hour_millicents: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageClass {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub max_size_gb: i64,
    pub read_iops_limit: i64,
    pub write_iops_limit: i64,
    pub read_bandwidth_limit: i64,
    pub write_bandwidth_limit: i64,
    pub replica_count: i64,
    pub price_per_gb_hour_millicents: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkClass {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub download_mbit_limit: i64,
    pub upload_mbit_limit: i64,
    pub included_traffic_gb: i64,
    pub price_per_hour_millicents: f64,
    pub traffic_price_per_gb_millicents: f64,
    pub is_active: bool,
}

/// Templates are looked up by `os_type` (e.g. "ubuntu"), not by display name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmTemplate {
    pub id: i64,
    pub name: String,
    pub api_name: String,
    pub os_family: String,
    pub os_type: String,
    pub version: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_id_canonical() {
        assert_eq!(RawId::Int(7).canonical().unwrap(), ResourceId(7));
        assert_eq!(RawId::Float(7.0).canonical().unwrap(), ResourceId(7));
        assert_eq!(RawId::Text(" 7 ".into()).canonical().unwrap(), ResourceId(7));
        assert!(RawId::Text("".into()).canonical().is_err());
        assert!(RawId::Text("abc".into()).canonical().is_err());
        assert!(RawId::Float(7.5).canonical().is_err());
        assert!(RawId::Int(0).canonical().is_err());
    }

    #[test]
    fn test_job_status_resource_id_from_string_or_number() {
        let s: JobStatus =
            serde_json::from_str(r#"{"status":"finished","resource_id":"7"}"#).unwrap();
        assert_eq!(s.resource_id("42").unwrap(), ResourceId(7));
        let n: JobStatus =
            serde_json::from_str(r#"{"status":"finished","resource_id":7}"#).unwrap();
        assert_eq!(n.resource_id("42").unwrap(), ResourceId(7));
        let none: JobStatus = serde_json::from_str(r#"{"status":"finished"}"#).unwrap();
        assert!(matches!(
            none.resource_id("42"),
            Err(ApiError::MissingResourceId { .. })
        ));
    }

    #[test]
    fn test_job_progress_accepts_fractions() {
        let s: JobStatus =
            serde_json::from_str(r#"{"status":"running","progress":33.5}"#).unwrap();
        assert_eq!(s.progress, 33);
        let done: JobStatus =
            serde_json::from_str(r#"{"status":"running","progress":100.0}"#).unwrap();
        assert!(done.is_terminal());
        let text: JobStatus =
            serde_json::from_str(r#"{"status":"running","progress":"12.9"}"#).unwrap();
        assert_eq!(text.progress, 12);
        let null: JobStatus = serde_json::from_str(r#"{"status":"queued","progress":null}"#).unwrap();
        assert_eq!(null.progress, 0);
    }

    #[test]
    fn test_job_terminal_conditions() {
        let running = JobStatus {
            status: "running".into(),
            progress: 40,
            ..Default::default()
        };
        assert!(!running.is_terminal());
        assert!(JobStatus {
            status: "finished".into(),
            ..Default::default()
        }
        .is_terminal());
        assert!(JobStatus {
            error: true,
            ..Default::default()
        }
        .is_terminal());
        assert!(JobStatus {
            status: "running".into(),
            progress: 100,
            ..Default::default()
        }
        .is_terminal());
    }

    #[test]
    fn test_job_error_flag_becomes_domain_failure() {
        let s = JobStatus {
            status: "failed".into(),
            error: true,
            error_data: Some("quota exceeded".into()),
            ..Default::default()
        };
        let err = s.into_result("42").unwrap_err();
        assert_eq!(err.to_string(), "job 42 failed: quota exceeded");
    }

    #[test]
    fn test_handle_prefers_status_url() {
        let r: SubmitResponse =
            serde_json::from_str(r#"{"ok":true,"job_id":"9","status_url":"/jobs/9"}"#).unwrap();
        assert_eq!(r.job_handle(), Some(JobHandle::StatusUrl("/jobs/9".into())));

        let r: SubmitResponse = serde_json::from_str(r#"{"ok":true,"job_id":9}"#).unwrap();
        assert_eq!(r.job_handle(), Some(JobHandle::JobId("9".into())));

        let r: SubmitResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(r.job_handle(), None);
    }

    #[test]
    fn test_rejected_envelope_message() {
        let r: SubmitResponse = serde_json::from_str(
            r#"{"ok":false,"error":{"code":"NOT_FOUND","message":"SSH key not found"}}"#,
        )
        .unwrap();
        match r.check().unwrap_err() {
            ApiError::Rejected { code, message } => {
                assert_eq!(code.as_deref(), Some("NOT_FOUND"));
                assert_eq!(message, "SSH key not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_resource_wrapped_or_bare() {
        let bare: SshKey = decode_resource(br#"{"id":3,"key_name":"k"}"#, "ssh key").unwrap();
        let wrapped: SshKey =
            decode_resource(br#"{"ok":true,"data":{"id":3,"key_name":"k"}}"#, "ssh key").unwrap();
        assert_eq!(bare, wrapped);
    }

    #[test]
    fn test_nullable_fields_decode_as_none() {
        let vol: Volume =
            serde_json::from_str(r#"{"disk_uuid":"d1","state":"provisioned","vm_uuid":null}"#)
                .unwrap();
        assert_eq!(vol.vm_uuid, None);
        assert_eq!(vol.limits, None);
    }
}
