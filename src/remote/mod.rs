// ABOUTME: Remote API plumbing: transport, job polling, convergence waiting, wire models
// ABOUTME: Endpoint paths are fixed fragments appended to the configured base URL

pub mod client;
pub mod jobs;
pub mod models;
pub mod waiter;

pub use client::{RemoteClient, RequestTarget, ResponseEnvelope};
pub use models::{JobHandle, JobStatus, RawId, ResourceId};
pub use waiter::{EndpointProbe, Probe, Snapshot};

pub const SSH_KEYS_EP: &str = "/ssh-keys";
pub const NETWORKS_EP: &str = "/network";
pub const ROUTERS_EP: &str = "/router";
pub const VMS_EP: &str = "/vm";
pub const VOLUMES_EP: &str = "/volume";
pub const INSTANCES_EP: &str = "/instances";
pub const JOBS_EP: &str = "/tasks";

pub const VM_CLASSES_EP: &str = "/vm-classes";
pub const STORAGE_CLASSES_EP: &str = "/storage-classes";
pub const NETWORK_CLASSES_EP: &str = "/network-classes";
pub const VM_TEMPLATES_EP: &str = "/vm-templates";
