// ABOUTME: Volume lifecycle: create to provisioned, attach/detach to a VM, detach before delete
// ABOUTME: A volume in the "error" state never recovers, so waits stop there

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{
    delete_idempotent, non_empty, post_empty, read_optional, settle, submit, submit_with_retry,
    Reconciler,
};
use crate::error::{ApiError, Result};
use crate::remote::models::Volume;
use crate::remote::{EndpointProbe, RemoteClient, VOLUMES_EP};

#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub display_name: Option<String>,
    pub size_gb: i64,
    pub storage_class_id: i64,
    /// UUID of the VM to attach to; `None` leaves the volume detached.
    pub attached_vm_id: Option<String>,
}

pub struct VolumeReconciler {
    client: RemoteClient,
}

fn volume_endpoint(uuid: &str) -> String {
    format!("{}/{}", VOLUMES_EP, uuid)
}

fn attached_vm(volume: &Volume) -> Option<&str> {
    volume.vm_uuid.as_deref().filter(|v| !v.is_empty())
}

impl VolumeReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    async fn wait_state(&self, uuid: &str, targets: &'static [&'static str]) -> Result<Volume> {
        let probe = EndpointProbe::<Volume>::new(
            &self.client,
            format!("volume {}", uuid),
            volume_endpoint(uuid),
        );
        self.client
            .wait_until(&probe, self.client.config().timeouts.volume_state, |v: &Volume| {
                targets.contains(&v.state.as_str())
            })
            .await
    }

    async fn attach(&self, uuid: &str, vm_uuid: &str) -> Result<Volume> {
        // The VM may have been created in the same run and not be visible yet.
        submit_with_retry(
            &self.client,
            &format!("{}/attach", volume_endpoint(uuid)),
            &json!({ "vm_uuid": vm_uuid }),
        )
        .await?;
        let volume = self.wait_state(uuid, &["attached"]).await?;
        info!(volume = %uuid, vm = %vm_uuid, "Volume attached");
        Ok(volume)
    }

    async fn detach(&self, uuid: &str) -> Result<Volume> {
        post_empty(&self.client, &format!("{}/detach", volume_endpoint(uuid))).await?;
        let volume = self.wait_state(uuid, &["provisioned", "detached"]).await?;
        info!(volume = %uuid, "Volume detached");
        Ok(volume)
    }
}

#[async_trait]
impl Reconciler for VolumeReconciler {
    type Desired = VolumeSpec;
    type Observed = Volume;
    type Id = String;

    fn id_of(observed: &Volume) -> String {
        observed.disk_uuid.clone()
    }

    async fn create(&self, desired: &VolumeSpec) -> Result<Volume> {
        if desired.size_gb <= 0 {
            return Err(ApiError::Invalid(format!(
                "size_gb must be positive, got {}",
                desired.size_gb
            )));
        }

        let mut payload = json!({
            "size_gb": desired.size_gb,
            "storage_class_id": desired.storage_class_id,
        });
        if let Some(name) = non_empty(&desired.display_name) {
            payload["display_name"] = json!(name);
        }

        let submitted = settle(&self.client, submit(&self.client, VOLUMES_EP, &payload).await?).await?;
        let uuid = match &submitted.job {
            Some(job) => job
                .resource_id
                .as_ref()
                .map(|id| id.as_text())
                .ok_or_else(|| ApiError::MissingResourceId {
                    job: submitted.job_label.clone().unwrap_or_default(),
                })?,
            None => submitted.body::<Volume>("volume")?.disk_uuid,
        };
        if uuid.is_empty() {
            return Err(ApiError::InvalidResourceId("empty disk_uuid".into()));
        }

        let mut volume = self.wait_state(&uuid, &["provisioned"]).await?;
        info!(volume = %uuid, "Volume provisioned");

        if let Some(vm_uuid) = non_empty(&desired.attached_vm_id) {
            volume = self
                .attach(&uuid, vm_uuid)
                .await
                .map_err(|e| e.at_step("attach volume to vm"))?;
        }

        if let Some(name) = non_empty(&desired.display_name) {
            volume.display_name = name.to_string();
        }
        Ok(volume)
    }

    async fn read(&self, id: &String) -> Result<Option<Volume>> {
        read_optional(&self.client, &volume_endpoint(id), "volume").await
    }

    async fn update(&self, desired: &VolumeSpec, previous: &Volume) -> Result<Volume> {
        if desired.size_gb != previous.size_gb || desired.storage_class_id != previous.storage_class_id {
            return Err(ApiError::Invalid(
                "size_gb and storage_class_id cannot change in place, the volume must be replaced"
                    .into(),
            ));
        }

        let uuid = previous.disk_uuid.as_str();
        let old_vm = attached_vm(previous);
        let new_vm = non_empty(&desired.attached_vm_id);

        let mut volume = None;
        if old_vm.is_some() && old_vm != new_vm {
            volume = Some(
                self.detach(uuid)
                    .await
                    .map_err(|e| e.at_step("detach volume from vm"))?,
            );
        }
        if let Some(vm_uuid) = new_vm {
            if old_vm != Some(vm_uuid) {
                volume = Some(
                    self.attach(uuid, vm_uuid)
                        .await
                        .map_err(|e| e.at_step("attach volume to vm"))?,
                );
            }
        }

        match volume {
            Some(v) => Ok(v),
            None => self
                .client
                .get_json(&volume_endpoint(uuid), &[], "volume")
                .await
                .map_err(|e| e.at_step("read volume after update")),
        }
    }

    async fn delete(&self, id: &String) -> Result<()> {
        let label = format!("volume {}", id);
        let Some(current) = self.read(id).await? else {
            info!(resource = %label, "Already gone");
            return Ok(());
        };

        if attached_vm(&current).is_some() {
            match self.detach(id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e @ ApiError::Timeout { .. }) => {
                    warn!(volume = %id, error = %e, "Detach not confirmed, deleting anyway");
                }
                Err(e) => return Err(e.at_step("detach volume before delete")),
            }
        }

        delete_idempotent(&self.client, &volume_endpoint(id), &label).await
    }
}
