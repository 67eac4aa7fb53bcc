// ABOUTME: Control-plane client for an eventually consistent infrastructure API
// ABOUTME: Makes asynchronous jobs and provisioning look synchronous and idempotent to callers

pub mod catalog;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod remote;

pub use config::{ClientConfig, Timeouts};
pub use error::{ApiError, ErrorClass, Result};
pub use reconcile::Reconciler;
pub use remote::{JobHandle, JobStatus, RemoteClient, ResourceId};
