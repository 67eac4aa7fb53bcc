// ABOUTME: Immutable client configuration: origin, credential, redirect cap, named timeouts
// ABOUTME: Loaded once from an optional TOML file and environment, then shared read-only

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "https://platform.serverscamp.com/api/v1";
pub const ENV_API_URL: &str = "SCAMP_API_URL";
pub const ENV_TOKEN: &str = "SCAMP_TOKEN";

pub const DEFAULT_MAX_REDIRECTS: usize = 20;
pub const MIN_MAX_REDIRECTS: usize = 10;

/// Per-operation patience. Each phase of a reconcile gets its own full budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    /// Pre-condition wait for a freshly created SSH key to become readable.
    pub key_visibility: Duration,
    /// How long a submission keeps being retried while a prerequisite is not visible.
    pub enqueue_window: Duration,
    pub enqueue_retry_interval: Duration,
    pub job_poll_interval: Duration,
    pub job_wait: Duration,
    /// Pause between a finished job and the first read of the resource it produced.
    pub post_job_settle: Duration,
    pub network_active: Duration,
    pub router_active: Duration,
    pub vm_running: Duration,
    pub vm_toggle: Duration,
    pub volume_state: Duration,
    pub instance_provisioned: Duration,
    /// Wait for a network to report `servers_count == 0` before deleting it.
    pub network_drain: Duration,
    pub convergence_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            key_visibility: Duration::from_secs(60),
            enqueue_window: Duration::from_secs(120),
            enqueue_retry_interval: Duration::from_secs(3),
            job_poll_interval: Duration::from_secs(2),
            job_wait: Duration::from_secs(600),
            post_job_settle: Duration::from_secs(2),
            network_active: Duration::from_secs(120),
            router_active: Duration::from_secs(120),
            vm_running: Duration::from_secs(300),
            vm_toggle: Duration::from_secs(300),
            volume_state: Duration::from_secs(300),
            instance_provisioned: Duration::from_secs(600),
            network_drain: Duration::from_secs(120),
            convergence_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    max_redirects: usize,
    pub request_timeout: Duration,
    pub timeouts: Timeouts,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: if base_url.is_empty() {
                DEFAULT_BASE_URL.to_string()
            } else {
                base_url
            },
            token: token.into(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            request_timeout: Duration::from_secs(60),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the redirect cap; values below `MIN_MAX_REDIRECTS` are raised to it.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max.max(MIN_MAX_REDIRECTS);
        self
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Resolve configuration from an optional file and the process environment.
    ///
    /// API URL: file > `SCAMP_API_URL` > default. Token: `SCAMP_TOKEN` > file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => FileConfig::read(p)?,
            None => FileConfig::default(),
        };
        Self::resolve(
            file,
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_TOKEN).ok(),
        )
    }

    fn resolve(file: FileConfig, env_url: Option<String>, env_token: Option<String>) -> Result<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let base_url = non_empty(file.api_url)
            .or_else(|| non_empty(env_url))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let token = match non_empty(env_token).or_else(|| non_empty(file.token)) {
            Some(t) => t,
            None => bail!(
                "Missing API token. Set token in the config file or the {} environment variable",
                ENV_TOKEN
            ),
        };

        let mut config = ClientConfig::new(base_url, token);
        if let Some(max) = file.max_redirects {
            config = config.with_max_redirects(max);
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        file.timeouts.apply(&mut config.timeouts);
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    token: Option<String>,
    max_redirects: Option<usize>,
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    timeouts: FileTimeouts,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    key_visibility_secs: Option<u64>,
    enqueue_window_secs: Option<u64>,
    enqueue_retry_interval_secs: Option<u64>,
    job_poll_interval_secs: Option<u64>,
    job_wait_secs: Option<u64>,
    post_job_settle_secs: Option<u64>,
    network_active_secs: Option<u64>,
    router_active_secs: Option<u64>,
    vm_running_secs: Option<u64>,
    vm_toggle_secs: Option<u64>,
    volume_state_secs: Option<u64>,
    instance_provisioned_secs: Option<u64>,
    network_drain_secs: Option<u64>,
    convergence_interval_secs: Option<u64>,
}

impl FileTimeouts {
    fn apply(&self, t: &mut Timeouts) {
        let set = |slot: &mut Duration, v: Option<u64>| {
            if let Some(secs) = v {
                *slot = Duration::from_secs(secs);
            }
        };
        set(&mut t.key_visibility, self.key_visibility_secs);
        set(&mut t.enqueue_window, self.enqueue_window_secs);
        set(&mut t.enqueue_retry_interval, self.enqueue_retry_interval_secs);
        set(&mut t.job_poll_interval, self.job_poll_interval_secs);
        set(&mut t.job_wait, self.job_wait_secs);
        set(&mut t.post_job_settle, self.post_job_settle_secs);
        set(&mut t.network_active, self.network_active_secs);
        set(&mut t.router_active, self.router_active_secs);
        set(&mut t.vm_running, self.vm_running_secs);
        set(&mut t.vm_toggle, self.vm_toggle_secs);
        set(&mut t.volume_state, self.volume_state_secs);
        set(&mut t.instance_provisioned, self.instance_provisioned_secs);
        set(&mut t.network_drain, self.network_drain_secs);
        set(&mut t.convergence_interval, self.convergence_interval_secs);
    }
}
