// ABOUTME: SSH key lifecycle: generate or import, idempotent delete
// ABOUTME: Also hosts the key-visibility pre-condition used before creating machines

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{delete_idempotent, non_empty, read_optional, Reconciler};
use crate::error::{ApiError, Result};
use crate::remote::models::SshKey;
use crate::remote::{EndpointProbe, RemoteClient, ResourceId, SSH_KEYS_EP};

#[derive(Debug, Clone, Default)]
pub struct SshKeySpec {
    pub key_name: Option<String>,
    /// Ask the backend for a new Ed25519 pair. Mutually exclusive with `public_key`.
    pub generate: bool,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshKeyState {
    pub key: SshKey,
    pub generate: bool,
}

pub struct SshKeyReconciler {
    client: RemoteClient,
}

impl SshKeyReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

fn key_endpoint(id: ResourceId) -> String {
    format!("{}/{}", SSH_KEYS_EP, id)
}

/// Block until `GET /ssh-keys/{id}` returns the key. A 404 counts as "not indexed yet".
pub async fn wait_key_visible(client: &RemoteClient, id: ResourceId) -> Result<SshKey> {
    let probe = EndpointProbe::<SshKey>::new(client, format!("ssh_key {}", id), key_endpoint(id))
        .missing_is_pending();
    let key = client
        .wait_until(&probe, client.config().timeouts.key_visibility, |k: &SshKey| {
            k.id == id.0
        })
        .await?;
    info!(ssh_key = %id, "SSH key visible");
    Ok(key)
}

#[async_trait]
impl Reconciler for SshKeyReconciler {
    type Desired = SshKeySpec;
    type Observed = SshKeyState;
    type Id = ResourceId;

    fn id_of(observed: &SshKeyState) -> ResourceId {
        ResourceId(observed.key.id)
    }

    fn carry_local(previous: &SshKeyState, fresh: &mut SshKeyState) {
        fresh.generate = previous.generate;
        fresh.key.private_key = previous.key.private_key.clone();
        if previous.key.public_key.trim() == fresh.key.public_key.trim() {
            fresh.key.public_key = previous.key.public_key.clone();
        }
    }

    async fn create(&self, desired: &SshKeySpec) -> Result<SshKeyState> {
        let public_key = non_empty(&desired.public_key);
        match (desired.generate, public_key) {
            (true, Some(_)) => {
                return Err(ApiError::Invalid(
                    "cannot set both generate and public_key".into(),
                ))
            }
            (false, None) => {
                return Err(ApiError::Invalid(
                    "set either generate or public_key for import".into(),
                ))
            }
            _ => {}
        }

        let mut payload = json!({});
        if let Some(name) = non_empty(&desired.key_name) {
            payload["key_name"] = json!(name);
        }

        let state = if let Some(public_key) = public_key {
            payload["public_key"] = json!(public_key);
            let mut key: SshKey = self
                .client
                .post_json(&format!("{}/import", SSH_KEYS_EP), &payload, "ssh key")
                .await?;
            // Keep the caller's text (file() contents usually carry a trailing newline).
            key.public_key = desired.public_key.clone().unwrap_or_default();
            key.private_key = None;
            SshKeyState {
                key,
                generate: false,
            }
        } else {
            let key: SshKey = self
                .client
                .post_json(&format!("{}/generate", SSH_KEYS_EP), &payload, "ssh key")
                .await?;
            SshKeyState {
                key,
                generate: true,
            }
        };

        if state.key.id <= 0 {
            return Err(ApiError::InvalidResourceId(state.key.id.to_string()));
        }
        info!(ssh_key = state.key.id, name = %state.key.key_name, "SSH key created");
        Ok(state)
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<SshKeyState>> {
        let key: Option<SshKey> = read_optional(&self.client, &key_endpoint(*id), "ssh key").await?;
        Ok(key.map(|key| SshKeyState {
            key,
            generate: false,
        }))
    }

    /// Every attribute forces replacement, so there is nothing to send.
    async fn update(&self, _desired: &SshKeySpec, previous: &SshKeyState) -> Result<SshKeyState> {
        Ok(previous.clone())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        delete_idempotent(&self.client, &key_endpoint(*id), &format!("ssh_key {}", id)).await
    }
}
