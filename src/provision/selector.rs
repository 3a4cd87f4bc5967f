use std::cmp::Ordering;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{ContainerSpec, NodeInfo, NodeInventory};

/// Picks the node that will host `spec`.
///
/// An explicit node is validated and returned as is. Otherwise the online
/// node with the lowest `cpu + memory` usage fraction among those able to
/// host the container wins, ties going to the lexically smallest name.
pub fn select(spec: &ContainerSpec, inventory: &NodeInventory) -> Result<String> {
    let volid = spec.template_volid();

    if let Some(name) = &spec.node {
        let node = inventory
            .get(name)
            .ok_or_else(|| Error::NodeUnavailable(format!("{name} is not a member of the cluster")))?;
        validate(node, spec, &volid)?;
        info!("Using requested node {}", name);
        return Ok(name.clone());
    }

    least_loaded(spec, inventory, &volid)
}

fn validate(node: &NodeInfo, spec: &ContainerSpec, volid: &str) -> Result<()> {
    if !node.online {
        return Err(Error::NodeUnavailable(format!("{} is offline", node.name)));
    }
    if !node.has_storage_pool(&spec.storage_pool) {
        return Err(Error::NodeUnavailable(format!(
            "{} has no storage pool {}",
            node.name, spec.storage_pool
        )));
    }
    if !node.has_template(volid) {
        return Err(Error::TemplateMissing {
            template: volid.to_string(),
            node: node.name.clone(),
        });
    }
    let mem_total_mb = node.mem_total / (1024 * 1024);
    if (node.cores > 0 && spec.cores > node.cores) || (mem_total_mb > 0 && spec.memory_mb > mem_total_mb) {
        return Err(Error::NodeUnavailable(format!(
            "{} cannot fit {} cores / {} MB (has {} cores / {} MB)",
            node.name, spec.cores, spec.memory_mb, node.cores, mem_total_mb
        )));
    }
    Ok(())
}

fn least_loaded(spec: &ContainerSpec, inventory: &NodeInventory, volid: &str) -> Result<String> {
    let online: Vec<&NodeInfo> = inventory.online().collect();
    if online.is_empty() {
        return Err(Error::NodeUnavailable("no online nodes in the cluster".to_string()));
    }

    let mut rejected = Vec::new();
    let mut candidates = Vec::new();
    for node in online {
        match validate(node, spec, volid) {
            Ok(()) => candidates.push(node),
            Err(e) => {
                debug!("Skipping {}: {}", node.name, e);
                rejected.push(e);
            }
        }
    }

    let best = candidates.into_iter().min_by(|a, b| {
        a.load_score()
            .total_cmp(&b.load_score())
            .then_with(|| a.name.cmp(&b.name))
    });

    match best {
        Some(node) => {
            info!("Selected least-loaded node {} (score {:.3})", node.name, node.load_score());
            Ok(node.name.clone())
        }
        None if rejected.iter().all(|e| matches!(e, Error::TemplateMissing { .. })) => {
            Err(Error::TemplateMissing {
                template: volid.to_string(),
                node: "any online node".to_string(),
            })
        }
        None => Err(Error::NodeUnavailable(format!(
            "no online node can host {}: {}",
            spec.hostname,
            rejected
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ))),
    }
}

/// Orders nodes the way automatic selection ranks them.
pub fn rank(inventory: &NodeInventory) -> Vec<&NodeInfo> {
    let mut nodes: Vec<&NodeInfo> = inventory.online().collect();
    nodes.sort_by(|a, b| match a.load_score().total_cmp(&b.load_score()) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });
    nodes
}
