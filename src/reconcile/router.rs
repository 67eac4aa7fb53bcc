// ABOUTME: Router lifecycle: create and converge to active, idempotent delete
// ABOUTME: Description and tags are local-only and carried across reads

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{delete_idempotent, non_empty, read_optional, settle, submit, Reconciler};
use crate::error::{ApiError, Result};
use crate::remote::models::Router;
use crate::remote::{EndpointProbe, RemoteClient, ROUTERS_EP};

#[derive(Debug, Clone, Default)]
pub struct RouterSpec {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterState {
    pub router: Router,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
}

pub struct RouterReconciler {
    client: RemoteClient,
}

impl RouterReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    async fn wait_active(&self, uuid: &str) -> Result<Router> {
        let probe = EndpointProbe::<Router>::new(
            &self.client,
            format!("router {}", uuid),
            router_endpoint(uuid),
        )
        .missing_is_pending();
        self.client
            .wait_until(&probe, self.client.config().timeouts.router_active, |r: &Router| {
                r.status == "active"
            })
            .await
    }
}

fn router_endpoint(uuid: &str) -> String {
    format!("{}/{}", ROUTERS_EP, uuid)
}

#[async_trait]
impl Reconciler for RouterReconciler {
    type Desired = RouterSpec;
    type Observed = RouterState;
    type Id = String;

    fn id_of(observed: &RouterState) -> String {
        observed.router.router_uuid.clone()
    }

    fn carry_local(previous: &RouterState, fresh: &mut RouterState) {
        fresh.description = previous.description.clone();
        fresh.tags = previous.tags.clone();
    }

    async fn create(&self, desired: &RouterSpec) -> Result<RouterState> {
        let mut payload = json!({});
        if let Some(name) = non_empty(&desired.name) {
            payload["name"] = json!(name);
        }

        let submitted = settle(&self.client, submit(&self.client, ROUTERS_EP, &payload).await?).await?;
        let uuid = match &submitted.job {
            Some(job) => job
                .resource_id
                .as_ref()
                .map(|id| id.as_text())
                .ok_or_else(|| ApiError::MissingResourceId {
                    job: submitted.job_label.clone().unwrap_or_default(),
                })?,
            None => submitted.body::<Router>("router")?.router_uuid,
        };
        if uuid.is_empty() {
            return Err(ApiError::InvalidResourceId("empty router_uuid".into()));
        }

        let mut router = self.wait_active(&uuid).await?;
        info!(router = %uuid, "Router active");

        if let Some(name) = non_empty(&desired.name) {
            router.name = name.to_string();
        }
        Ok(RouterState {
            router,
            description: desired.description.clone(),
            tags: desired.tags.clone(),
        })
    }

    async fn read(&self, id: &String) -> Result<Option<RouterState>> {
        let router: Option<Router> = read_optional(&self.client, &router_endpoint(id), "router").await?;
        Ok(router.map(|router| RouterState {
            router,
            description: None,
            tags: BTreeMap::new(),
        }))
    }

    /// The API has no router mutations; only local fields change.
    async fn update(&self, desired: &RouterSpec, previous: &RouterState) -> Result<RouterState> {
        Ok(RouterState {
            router: previous.router.clone(),
            description: desired.description.clone(),
            tags: desired.tags.clone(),
        })
    }

    async fn delete(&self, id: &String) -> Result<()> {
        delete_idempotent(&self.client, &router_endpoint(id), &format!("router {}", id)).await
    }
}
