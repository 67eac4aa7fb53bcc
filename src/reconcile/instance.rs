// ABOUTME: Legacy job-based instance lifecycle: key pre-condition, enqueue retry, job, provisioning wait
// ABOUTME: Reads fall back to listing the collection when the item endpoint is unavailable

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::ssh_key::wait_key_visible;
use super::{delete_idempotent, non_empty, settle, submit, submit_with_retry, Reconciler};
use crate::error::{ApiError, Result};
use crate::remote::models::{Instance, InstanceList};
use crate::remote::{Probe, RemoteClient, ResourceId, INSTANCES_EP};

/// `create_status` value the backend uses for "created and running".
pub const PROVISIONED_CREATE_STATUS: i64 = 4;

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub flavor: i64,
    pub image: i64,
    pub ssh_key: ResourceId,
    pub dc: Option<String>,
    pub password: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub instance: Instance,
    /// Not returned by the API; kept as requested.
    pub dc: Option<String>,
}

#[derive(Serialize)]
struct CreateInstancePayload<'a> {
    name: &'a str,
    flavor: i64,
    image: i64,
    ssh_key: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dc: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

impl InstanceSpec {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ApiError::Invalid("instance name is required".into()));
        }
        if self.flavor <= 0 || self.image <= 0 || self.ssh_key.0 <= 0 {
            return Err(ApiError::Invalid(format!(
                "flavor={} image={} ssh_key={} must be > 0",
                self.flavor, self.image, self.ssh_key
            )));
        }
        Ok(())
    }
}

/// Ready once the backend reports full provisioning. Older backends omit `create_status`
/// and `status`, so a running machine with an address also counts.
pub fn is_provisioned(instance: &Instance) -> bool {
    if let Some(cs) = instance.create_status {
        return cs >= PROVISIONED_CREATE_STATUS;
    }
    if let Some(status) = instance.status.as_deref().filter(|s| !s.is_empty()) {
        return status == "active";
    }
    instance.running && !instance.ipv4.is_empty()
}

fn instance_endpoint(id: ResourceId) -> String {
    format!("{}/{}", INSTANCES_EP, id)
}

fn pick(list: InstanceList, id: ResourceId) -> Option<Instance> {
    list.instances.into_iter().find(|i| i.id == Some(id.0))
}

/// Read one instance. The item endpoint answers with the same list envelope as the
/// collection; when it is missing (404/405) the whole collection is scanned instead.
pub async fn fetch_instance(client: &RemoteClient, id: ResourceId) -> Result<Option<Instance>> {
    let list: InstanceList = match client.get_json(&instance_endpoint(id), &[], "instance").await {
        Ok(list) => list,
        Err(e) if e.is_not_found() || e.status() == Some(405) => {
            debug!(instance = %id, status = ?e.status(), "Item read unavailable, listing instances");
            client.get_json(INSTANCES_EP, &[], "instance list").await?
        }
        Err(e) => return Err(e),
    };
    Ok(pick(list, id))
}

struct InstanceProbe<'a> {
    client: &'a RemoteClient,
    id: ResourceId,
}

#[async_trait]
impl Probe for InstanceProbe<'_> {
    type Output = Instance;

    fn target(&self) -> String {
        format!("instance {}", self.id)
    }

    async fn observe(&self) -> Result<Option<Instance>> {
        fetch_instance(self.client, self.id).await
    }
}

pub struct InstanceReconciler {
    client: RemoteClient,
}

impl InstanceReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    /// Most recently created instance whose name matches exactly.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Instance>> {
        let list: InstanceList = self
            .client
            .get_json(INSTANCES_EP, &[("name", name.to_string())], "instance list")
            .await?;
        Ok(list
            .instances
            .into_iter()
            .filter(|i| i.name == name)
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    async fn set_power(&self, id: ResourceId, running: bool) -> Result<Instance> {
        let action = if running { "start" } else { "stop" };
        submit(&self.client, &format!("{}/{}", instance_endpoint(id), action), &json!({})).await?;
        let probe = InstanceProbe {
            client: &self.client,
            id,
        };
        let instance = self
            .client
            .wait_until(&probe, self.client.config().timeouts.vm_toggle, |i: &Instance| {
                i.running == running
            })
            .await?;
        info!(instance = %id, running, "Instance power state changed");
        Ok(instance)
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    type Desired = InstanceSpec;
    type Observed = InstanceState;
    type Id = ResourceId;

    fn id_of(observed: &InstanceState) -> ResourceId {
        ResourceId(observed.instance.id.unwrap_or_default())
    }

    fn carry_local(previous: &InstanceState, fresh: &mut InstanceState) {
        fresh.dc = previous.dc.clone();
    }

    async fn create(&self, desired: &InstanceSpec) -> Result<InstanceState> {
        desired.validate()?;

        wait_key_visible(&self.client, desired.ssh_key)
            .await
            .map_err(|e| e.at_step("wait for ssh key"))?;

        let payload = CreateInstancePayload {
            name: desired.name.trim(),
            flavor: desired.flavor,
            image: desired.image,
            ssh_key: desired.ssh_key.0,
            dc: non_empty(&desired.dc),
            password: non_empty(&desired.password),
        };
        let response = submit_with_retry(&self.client, INSTANCES_EP, &payload).await?;
        let submitted = settle(&self.client, response).await?;

        let (Some(job), Some(label)) = (&submitted.job, &submitted.job_label) else {
            return Err(ApiError::Rejected {
                code: None,
                message: "instance submission returned neither status_url nor job_id".into(),
            });
        };
        let id = job.resource_id(label)?;

        let probe = InstanceProbe {
            client: &self.client,
            id,
        };
        let mut instance = self
            .client
            .wait_until(
                &probe,
                self.client.config().timeouts.instance_provisioned,
                is_provisioned,
            )
            .await
            .map_err(|e| e.at_step("wait for instance provisioning"))?;
        info!(instance = %id, "Instance provisioned");

        if !desired.running && instance.running {
            instance = self
                .set_power(id, false)
                .await
                .map_err(|e| e.at_step("stop instance"))?;
        }

        // The backend may shorten the display name and reports flavor lazily.
        instance.name = desired.name.clone();
        instance.flavor_id = Some(desired.flavor);
        Ok(InstanceState {
            instance,
            dc: non_empty(&desired.dc).map(str::to_string),
        })
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<InstanceState>> {
        Ok(fetch_instance(&self.client, *id)
            .await?
            .map(|instance| InstanceState { instance, dc: None }))
    }

    async fn update(&self, desired: &InstanceSpec, previous: &InstanceState) -> Result<InstanceState> {
        let current = &previous.instance;
        if current.image_id.is_some_and(|i| i != desired.image)
            || current.ssh_key_id.is_some_and(|k| k != desired.ssh_key.0)
            || current.flavor_id.is_some_and(|f| f != desired.flavor)
        {
            return Err(ApiError::Invalid(
                "flavor, image and ssh_key cannot change in place, the instance must be replaced"
                    .into(),
            ));
        }

        let id = Self::id_of(previous);
        let instance = if current.running != desired.running {
            self.set_power(id, desired.running).await.map_err(|e| {
                e.at_step(if desired.running { "start instance" } else { "stop instance" })
            })?
        } else {
            current.clone()
        };

        let mut state = InstanceState { instance, dc: None };
        Self::carry_local(previous, &mut state);
        Ok(state)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        delete_idempotent(&self.client, &instance_endpoint(*id), &format!("instance {}", id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioned_prefers_create_status() {
        let mut i = Instance {
            create_status: Some(3),
            running: true,
            ipv4: "10.0.0.2".into(),
            ..Default::default()
        };
        assert!(!is_provisioned(&i));
        i.create_status = Some(4);
        assert!(is_provisioned(&i));
    }

    #[test]
    fn test_provisioned_falls_back_to_status_then_address() {
        let mut i = Instance {
            status: Some("creating".into()),
            running: true,
            ipv4: "10.0.0.2".into(),
            ..Default::default()
        };
        assert!(!is_provisioned(&i));
        i.status = Some("active".into());
        assert!(is_provisioned(&i));

        i.status = None;
        assert!(is_provisioned(&i));
        i.ipv4.clear();
        assert!(!is_provisioned(&i));
    }

    #[test]
    fn test_pick_matches_id() {
        let list = InstanceList {
            instances: vec![
                Instance {
                    id: Some(1),
                    name: "a".into(),
                    ..Default::default()
                },
                Instance {
                    id: Some(7),
                    name: "b".into(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(pick(list.clone(), ResourceId(7)).map(|i| i.name), Some("b".into()));
        assert!(pick(list, ResourceId(9)).is_none());
    }

    #[test]
    fn test_validate_rejects_non_positive_ids() {
        let spec = InstanceSpec {
            name: "web".into(),
            flavor: 1,
            image: 0,
            ssh_key: ResourceId(3),
            dc: None,
            password: None,
            running: true,
        };
        assert!(matches!(spec.validate(), Err(ApiError::Invalid(_))));
    }
}
