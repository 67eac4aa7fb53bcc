// ABOUTME: Virtual machine lifecycle: create and converge to running, power and protection toggles
// ABOUTME: Deletion is refused while the machine is protected

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::ssh_key::wait_key_visible;
use super::{
    delete_idempotent, non_empty, read_optional, settle, submit, submit_with_retry, Reconciler,
};
use crate::error::{ApiError, Result};
use crate::remote::models::{Vm, VmCreateResponse};
use crate::remote::{EndpointProbe, RemoteClient, ResourceId, VMS_EP};

pub const MIN_DISK_GB: i64 = 10;
pub const MAX_DISK_GB: i64 = 1000;

#[derive(Debug, Clone)]
pub struct VmSpec {
    pub vm_class_id: i64,
    pub storage_class_id: i64,
    pub network_class_id: i64,
    pub vm_template_id: i64,
    pub network_uuid: String,
    pub disk_gb: i64,
    pub display_name: Option<String>,
    pub ssh_key_id: Option<ResourceId>,
    /// Write-only; the API returns it once at creation.
    pub os_password: Option<String>,
    pub assign_public_ips: bool,
    pub running: bool,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmState {
    pub vm: Vm,
    pub os_password: Option<String>,
    pub assign_public_ips: bool,
}

#[derive(Serialize)]
struct CreateVmPayload<'a> {
    vm_class_id: i64,
    storage_class_id: i64,
    network_class_id: i64,
    vm_template_id: i64,
    network_uuid: &'a str,
    disk_gb: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh_key_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os_password: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    assign_public_ips: bool,
}

impl VmSpec {
    fn validate(&self) -> Result<()> {
        if self.network_uuid.trim().is_empty() {
            return Err(ApiError::Invalid("network_uuid is required".into()));
        }
        if !(MIN_DISK_GB..=MAX_DISK_GB).contains(&self.disk_gb) {
            return Err(ApiError::Invalid(format!(
                "disk_gb must be between {} and {}, got {}",
                MIN_DISK_GB, MAX_DISK_GB, self.disk_gb
            )));
        }
        Ok(())
    }

    fn payload(&self) -> CreateVmPayload<'_> {
        CreateVmPayload {
            vm_class_id: self.vm_class_id,
            storage_class_id: self.storage_class_id,
            network_class_id: self.network_class_id,
            vm_template_id: self.vm_template_id,
            network_uuid: self.network_uuid.trim(),
            disk_gb: self.disk_gb,
            display_name: non_empty(&self.display_name),
            ssh_key_id: self.ssh_key_id.map(|id| id.0),
            os_password: non_empty(&self.os_password),
            assign_public_ips: self.assign_public_ips,
        }
    }

    /// Names of attributes that differ from `vm` and cannot be changed in place.
    fn replacement_fields(&self, vm: &Vm) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.vm_class_id != vm.vm_class_id {
            fields.push("vm_class_id");
        }
        if self.storage_class_id != vm.storage_class_id {
            fields.push("storage_class_id");
        }
        if self.network_class_id != vm.network_class_id {
            fields.push("network_class_id");
        }
        if self.vm_template_id != vm.vm_template_id {
            fields.push("vm_template_id");
        }
        if self.network_uuid.trim() != vm.network_uuid {
            fields.push("network_uuid");
        }
        if self.disk_gb != vm.disk_gb {
            fields.push("disk_gb");
        }
        fields
    }
}

pub struct VmReconciler {
    client: RemoteClient,
}

fn vm_endpoint(uuid: &str) -> String {
    format!("{}/{}", VMS_EP, uuid)
}

fn is_running(vm: &Vm) -> bool {
    vm.state == "running"
}

impl VmReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    fn probe(&self, uuid: &str) -> EndpointProbe<'_, Vm> {
        EndpointProbe::new(&self.client, format!("vm {}", uuid), vm_endpoint(uuid))
    }

    async fn set_power(&self, uuid: &str, running: bool) -> Result<Vm> {
        let action = if running { "start" } else { "stop" };
        submit(&self.client, &format!("{}/{}", vm_endpoint(uuid), action), &serde_json::json!({}))
            .await?;
        let vm = self
            .client
            .wait_until(&self.probe(uuid), self.client.config().timeouts.vm_toggle, |vm: &Vm| {
                is_running(vm) == running
            })
            .await?;
        info!(vm = %uuid, state = %vm.state, "VM power state changed");
        Ok(vm)
    }

    async fn set_protected(&self, uuid: &str, protected: bool) -> Result<Vm> {
        let action = if protected { "protect" } else { "unprotect" };
        submit(&self.client, &format!("{}/{}", vm_endpoint(uuid), action), &serde_json::json!({}))
            .await?;
        let vm = self
            .client
            .wait_until(&self.probe(uuid), self.client.config().timeouts.vm_toggle, |vm: &Vm| {
                vm.protected == protected
            })
            .await?;
        info!(vm = %uuid, protected, "VM protection changed");
        Ok(vm)
    }

    /// Power first, then protection. Each step is its own submit+converge cycle.
    async fn apply_toggles(&self, desired: &VmSpec, mut vm: Vm) -> Result<Vm> {
        let uuid = vm.vm_uuid.clone();
        if is_running(&vm) != desired.running {
            vm = self
                .set_power(&uuid, desired.running)
                .await
                .map_err(|e| e.at_step(if desired.running { "start vm" } else { "stop vm" }))?;
        }
        if vm.protected != desired.protected {
            vm = self
                .set_protected(&uuid, desired.protected)
                .await
                .map_err(|e| {
                    e.at_step(if desired.protected { "protect vm" } else { "unprotect vm" })
                })?;
        }
        Ok(vm)
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    type Desired = VmSpec;
    type Observed = VmState;
    type Id = String;

    fn id_of(observed: &VmState) -> String {
        observed.vm.vm_uuid.clone()
    }

    fn carry_local(previous: &VmState, fresh: &mut VmState) {
        fresh.os_password = previous.os_password.clone();
        fresh.assign_public_ips = previous.assign_public_ips;
    }

    async fn create(&self, desired: &VmSpec) -> Result<VmState> {
        desired.validate()?;

        if let Some(key_id) = desired.ssh_key_id {
            wait_key_visible(&self.client, key_id)
                .await
                .map_err(|e| e.at_step("wait for ssh key"))?;
        }

        let response = submit_with_retry(&self.client, VMS_EP, &desired.payload()).await?;
        let submitted = settle(&self.client, response).await?;

        // Synchronous creations answer with the machine; queued ones with a job.
        let created: Option<VmCreateResponse> = submitted.body("vm").ok();
        let uuid = match (&submitted.job, &created) {
            (Some(job), _) if job.resource_id.is_some() => job
                .resource_id
                .as_ref()
                .map(|id| id.as_text())
                .unwrap_or_default(),
            (_, Some(c)) if !c.vm_uuid.is_empty() => c.vm_uuid.clone(),
            (Some(_), _) => {
                return Err(ApiError::MissingResourceId {
                    job: submitted.job_label.clone().unwrap_or_default(),
                })
            }
            (None, _) => return Err(ApiError::InvalidResourceId("empty vm_uuid".into())),
        };

        let vm = self
            .client
            .wait_until(
                &self.probe(&uuid).missing_is_pending(),
                self.client.config().timeouts.vm_running,
                is_running,
            )
            .await?;
        info!(vm = %uuid, "VM running");

        let mut vm = self.apply_toggles(desired, vm).await?;
        if let Some(name) = non_empty(&desired.display_name) {
            vm.display_name = name.to_string();
        }

        let os_password = created
            .map(|c| c.os_password)
            .filter(|p| !p.is_empty())
            .or_else(|| desired.os_password.clone());
        Ok(VmState {
            vm,
            os_password,
            assign_public_ips: desired.assign_public_ips,
        })
    }

    async fn read(&self, id: &String) -> Result<Option<VmState>> {
        let vm: Option<Vm> = read_optional(&self.client, &vm_endpoint(id), "vm").await?;
        Ok(vm.map(|vm| VmState {
            vm,
            os_password: None,
            assign_public_ips: false,
        }))
    }

    async fn update(&self, desired: &VmSpec, previous: &VmState) -> Result<VmState> {
        let fields = desired.replacement_fields(&previous.vm);
        if !fields.is_empty() {
            return Err(ApiError::Invalid(format!(
                "cannot change {} in place, the vm must be replaced",
                fields.join(", ")
            )));
        }

        let uuid = previous.vm.vm_uuid.as_str();
        let current: Vm = self
            .client
            .get_json(&vm_endpoint(uuid), &[], "vm")
            .await
            .map_err(|e| e.at_step("read vm before update"))?;
        let vm = self.apply_toggles(desired, current).await?;

        let mut state = VmState {
            vm,
            os_password: None,
            assign_public_ips: false,
        };
        Self::carry_local(previous, &mut state);
        Ok(state)
    }

    async fn delete(&self, id: &String) -> Result<()> {
        let label = format!("vm {}", id);
        let Some(current) = self.read(id).await? else {
            info!(resource = %label, "Already gone");
            return Ok(());
        };
        if current.vm.protected {
            return Err(ApiError::Invalid(format!(
                "{} is protected; unprotect it before deleting",
                label
            )));
        }
        delete_idempotent(&self.client, &vm_endpoint(id), &label).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            vm_class_id: 1,
            storage_class_id: 2,
            network_class_id: 3,
            vm_template_id: 4,
            network_uuid: "net-1".into(),
            disk_gb: 20,
            display_name: Some("web".into()),
            ssh_key_id: None,
            os_password: None,
            assign_public_ips: false,
            running: true,
            protected: false,
        }
    }

    #[test]
    fn test_disk_bounds() {
        assert!(spec().validate().is_ok());
        let mut s = spec();
        s.disk_gb = 9;
        assert!(matches!(s.validate(), Err(ApiError::Invalid(_))));
        s.disk_gb = 1001;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_payload_omits_unset_fields() {
        let v = serde_json::to_value(spec().payload()).unwrap();
        assert_eq!(v["display_name"], "web");
        assert!(v.get("ssh_key_id").is_none());
        assert!(v.get("os_password").is_none());
        assert!(v.get("assign_public_ips").is_none());

        let mut s = spec();
        s.assign_public_ips = true;
        s.ssh_key_id = Some(ResourceId(7));
        let v = serde_json::to_value(s.payload()).unwrap();
        assert_eq!(v["assign_public_ips"], true);
        assert_eq!(v["ssh_key_id"], 7);
    }

    #[test]
    fn test_replacement_fields() {
        let vm = Vm {
            vm_class_id: 1,
            storage_class_id: 2,
            network_class_id: 3,
            vm_template_id: 4,
            network_uuid: "net-1".into(),
            disk_gb: 20,
            ..Default::default()
        };
        assert!(spec().replacement_fields(&vm).is_empty());

        let mut s = spec();
        s.disk_gb = 40;
        s.vm_class_id = 9;
        assert_eq!(s.replacement_fields(&vm), vec!["vm_class_id", "disk_gb"]);
    }

    #[test]
    fn test_carry_local_keeps_write_only_fields() {
        let previous = VmState {
            vm: Vm::default(),
            os_password: Some("s3cret".into()),
            assign_public_ips: true,
        };
        let mut fresh = VmState {
            vm: Vm::default(),
            os_password: None,
            assign_public_ips: false,
        };
        VmReconciler::carry_local(&previous, &mut fresh);
        assert_eq!(fresh.os_password.as_deref(), Some("s3cret"));
        assert!(fresh.assign_public_ips);
    }
}
