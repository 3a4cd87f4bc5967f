mod client;

pub use client::{create_params, ProxmoxAuth, ProxmoxClient};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ContainerSpec, ContainerSummary, NodeInfo};

/// Cluster management API. Every call is a single request (or a request
/// followed by waiting on the task it started) with its own timeout.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn version(&self) -> Result<String>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Asks the cluster for a free id. With a candidate, the cluster either
    /// confirms it is free or rejects it.
    async fn allocate_id(&self, candidate: Option<u32>) -> Result<u32>;

    /// Creates the container (stopped) and waits for the create task.
    async fn create_container(&self, node: &str, vmid: u32, spec: &ContainerSpec) -> Result<()>;

    async fn start_container(&self, node: &str, vmid: u32) -> Result<()>;

    /// Stops the container if running, then deletes it.
    async fn delete_container(&self, node: &str, vmid: u32, purge: bool) -> Result<()>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;
}
