use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proxmox::ControlPlane;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub online: bool,
    /// CPU usage as a fraction of all cores, 0.0..=1.0.
    pub cpu_usage: f64,
    pub cores: u32,
    pub mem_used: u64,
    pub mem_total: u64,
    pub storage_pools: Vec<String>,
    /// Template volume ids (`storage:vztmpl/file`) visible from this node.
    pub templates: Vec<String>,
}

impl NodeInfo {
    pub fn memory_fraction(&self) -> f64 {
        if self.mem_total == 0 {
            return 1.0;
        }
        self.mem_used as f64 / self.mem_total as f64
    }

    /// Lower is better.
    pub fn load_score(&self) -> f64 {
        self.cpu_usage + self.memory_fraction()
    }

    pub fn has_storage_pool(&self, pool: &str) -> bool {
        self.storage_pools.iter().any(|p| p == pool)
    }

    pub fn has_template(&self, volid: &str) -> bool {
        self.templates.iter().any(|t| t == volid)
    }
}

/// Snapshot of the cluster taken by the caller. The selector reads it; nothing
/// in the crate holds on to one between operations.
#[derive(Debug, Clone)]
pub struct NodeInventory {
    pub nodes: Vec<NodeInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl NodeInventory {
    pub fn from_nodes(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes,
            fetched_at: Utc::now(),
        }
    }

    pub async fn fetch(control_plane: &dyn ControlPlane) -> Result<Self> {
        let nodes = control_plane.list_nodes().await?;
        Ok(Self::from_nodes(nodes))
    }

    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn online(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| n.online)
    }
}
