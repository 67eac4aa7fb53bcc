// ABOUTME: Network lifecycle: create, converge to active, attach/detach router, drain and delete
// ABOUTME: Each router change is its own submit+converge cycle, detach before attach

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{
    delete_idempotent, non_empty, read_optional, settle, submit, submit_with_retry, Reconciler,
};
use crate::error::{ApiError, Result};
use crate::remote::models::Network;
use crate::remote::{EndpointProbe, RemoteClient, NETWORKS_EP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Private,
    Public,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkType::Private => write!(f, "private"),
            NetworkType::Public => write!(f, "public"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: Option<String>,
    pub cidr: Option<String>,
    pub network_type: NetworkType,
    /// Required for public networks, forbidden for private ones.
    pub router_uuid: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl NetworkSpec {
    pub fn private() -> Self {
        Self {
            name: None,
            cidr: None,
            network_type: NetworkType::Private,
            router_uuid: None,
            description: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn public(router_uuid: impl Into<String>) -> Self {
        Self {
            network_type: NetworkType::Public,
            router_uuid: Some(router_uuid.into()),
            ..Self::private()
        }
    }

    /// The router to attach to, after checking it agrees with the network type.
    fn router(&self) -> Result<Option<&str>> {
        match (self.network_type, non_empty(&self.router_uuid)) {
            (NetworkType::Public, None) => Err(ApiError::Invalid(
                "router_uuid is required when type is public".into(),
            )),
            (NetworkType::Private, Some(_)) => Err(ApiError::Invalid(
                "router_uuid must not be set when type is private".into(),
            )),
            (_, router) => Ok(router),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    pub network: Network,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

pub struct NetworkReconciler {
    client: RemoteClient,
}

fn network_endpoint(uuid: &str) -> String {
    format!("{}/{}", NETWORKS_EP, uuid)
}

impl NetworkReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    fn probe(&self, uuid: &str) -> EndpointProbe<'_, Network> {
        EndpointProbe::new(&self.client, format!("network {}", uuid), network_endpoint(uuid))
    }

    async fn wait_active(&self, uuid: &str) -> Result<Network> {
        self.client
            .wait_until(
                &self.probe(uuid).missing_is_pending(),
                self.client.config().timeouts.network_active,
                |n: &Network| n.status == "active",
            )
            .await
    }

    async fn attach(&self, uuid: &str, router_uuid: &str) -> Result<Network> {
        let endpoint = format!("{}/attach", network_endpoint(uuid));
        // A router created moments ago may not be visible to the network service yet.
        submit_with_retry(&self.client, &endpoint, &json!({ "router_uuid": router_uuid })).await?;
        let network = self
            .client
            .wait_until(
                &self.probe(uuid),
                self.client.config().timeouts.network_active,
                |n: &Network| n.router_uuid.as_deref() == Some(router_uuid),
            )
            .await?;
        info!(network = %uuid, router = %router_uuid, "Network attached");
        Ok(network)
    }

    async fn detach(&self, uuid: &str) -> Result<Network> {
        let endpoint = format!("{}/detach", network_endpoint(uuid));
        match self.client.delete(&endpoint).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let network = self
            .client
            .wait_until(
                &self.probe(uuid),
                self.client.config().timeouts.network_active,
                |n: &Network| n.router_uuid.is_none(),
            )
            .await?;
        info!(network = %uuid, "Network detached");
        Ok(network)
    }
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    type Desired = NetworkSpec;
    type Observed = NetworkState;
    type Id = String;

    fn id_of(observed: &NetworkState) -> String {
        observed.network.network_uuid.clone()
    }

    fn carry_local(previous: &NetworkState, fresh: &mut NetworkState) {
        fresh.description = previous.description.clone();
        fresh.tags = previous.tags.clone();
    }

    async fn create(&self, desired: &NetworkSpec) -> Result<NetworkState> {
        let router = desired.router()?;

        let mut payload = json!({});
        if let Some(name) = non_empty(&desired.name) {
            payload["name"] = json!(name);
        }
        if let Some(cidr) = non_empty(&desired.cidr) {
            payload["cidr"] = json!(cidr);
        }

        let submitted = settle(&self.client, submit(&self.client, NETWORKS_EP, &payload).await?).await?;
        let uuid = match &submitted.job {
            Some(job) => job
                .resource_id
                .as_ref()
                .map(|id| id.as_text())
                .ok_or_else(|| ApiError::MissingResourceId {
                    job: submitted.job_label.clone().unwrap_or_default(),
                })?,
            None => submitted.body::<Network>("network")?.network_uuid,
        };
        if uuid.is_empty() {
            return Err(ApiError::InvalidResourceId("empty network_uuid".into()));
        }

        let mut network = self.wait_active(&uuid).await?;
        info!(network = %uuid, "Network active");

        if let Some(router_uuid) = router {
            network = self
                .attach(&uuid, router_uuid)
                .await
                .map_err(|e| e.at_step("attach network to router"))?;
        }

        network.network_type = desired.network_type.to_string();
        if let Some(name) = non_empty(&desired.name) {
            network.name = name.to_string();
        }
        Ok(NetworkState {
            network,
            description: desired.description.clone(),
            tags: desired.tags.clone(),
        })
    }

    async fn read(&self, id: &String) -> Result<Option<NetworkState>> {
        let network: Option<Network> =
            read_optional(&self.client, &network_endpoint(id), "network").await?;
        Ok(network.map(|network| NetworkState {
            network,
            description: None,
            tags: BTreeMap::new(),
        }))
    }

    async fn update(&self, desired: &NetworkSpec, previous: &NetworkState) -> Result<NetworkState> {
        let new_router = desired.router()?;
        let uuid = previous.network.network_uuid.as_str();
        let old_router = previous
            .network
            .router_uuid
            .as_deref()
            .filter(|r| !r.is_empty());

        let mut network = None;
        if old_router.is_some() && old_router != new_router {
            network = Some(
                self.detach(uuid)
                    .await
                    .map_err(|e| e.at_step("detach network from router"))?,
            );
        }
        if let Some(router_uuid) = new_router {
            if old_router != Some(router_uuid) {
                network = Some(
                    self.attach(uuid, router_uuid)
                        .await
                        .map_err(|e| e.at_step("attach network to router"))?,
                );
            }
        }

        let mut network = match network {
            Some(n) => n,
            None => self
                .client
                .get_json(&network_endpoint(uuid), &[], "network")
                .await
                .map_err(|e| e.at_step("read network after update"))?,
        };
        network.network_type = desired.network_type.to_string();

        Ok(NetworkState {
            network,
            description: desired.description.clone(),
            tags: desired.tags.clone(),
        })
    }

    async fn delete(&self, id: &String) -> Result<()> {
        let label = format!("network {}", id);
        let Some(current) = self.read(id).await? else {
            info!(resource = %label, "Already gone");
            return Ok(());
        };

        if current.network.router_uuid.is_some() {
            if let Err(e) = self.client.delete(&format!("{}/detach", network_endpoint(id))).await {
                warn!(network = %id, error = %e, "Detach before delete failed, continuing");
            }
        }

        // Servers on the network may still be tearing down.
        if current.network.servers_count > 0 {
            match self
                .client
                .wait_until(
                    &self.probe(id),
                    self.client.config().timeouts.network_drain,
                    |n: &Network| n.servers_count == 0,
                )
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.at_step("wait for network to drain")),
            }
        }

        delete_idempotent(&self.client, &network_endpoint(id), &label).await
    }
}
