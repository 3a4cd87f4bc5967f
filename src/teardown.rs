use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{ContainerSummary, MatchCandidate};
use crate::overlay::{find_candidate, OverlayDirectory};
use crate::proxmox::ControlPlane;

/// Reads the live directory and returns the identity most likely registered
/// by `hostname`. Nothing is removed and nothing is cached, so repeated calls
/// against an unchanged directory return the same candidate.
pub async fn find_teardown_candidate(
    directory: &dyn OverlayDirectory,
    hostname: &str,
) -> Result<MatchCandidate> {
    let identities = directory.list_identities().await?;
    let candidate = find_candidate(hostname, &identities);
    if let Some(identity) = &candidate.identity {
        info!(
            "Overlay candidate for {}: {} ({}, {})",
            hostname, identity.name, identity.fqdn, candidate.confidence
        );
    }
    Ok(candidate)
}

/// Removes a candidate the caller has confirmed. Candidates without an
/// identity are refused.
pub async fn remove_candidate(directory: &dyn OverlayDirectory, candidate: &MatchCandidate) -> Result<()> {
    let identity = match (&candidate.identity, candidate.is_actionable()) {
        (Some(identity), true) => identity,
        _ => {
            return Err(Error::Config(
                "no overlay identity to remove".to_string(),
            ))
        }
    };

    directory.remove_identity(&identity.id).await?;
    info!("Removed overlay identity {} ({})", identity.name, identity.id);
    Ok(())
}

/// Looks a container up across the cluster.
pub async fn find_container(control_plane: &dyn ControlPlane, vmid: u32) -> Result<Option<ContainerSummary>> {
    let containers = control_plane.list_containers().await?;
    let found = containers.into_iter().find(|c| c.vmid == vmid);
    if found.is_none() {
        warn!("CT {} not found in the cluster", vmid);
    }
    Ok(found)
}

/// Deletes the container, stopping it first. With `purge` it is also removed
/// from backup jobs, replication and HA configuration.
pub async fn destroy_container(
    control_plane: &dyn ControlPlane,
    container: &ContainerSummary,
    purge: bool,
) -> Result<()> {
    control_plane
        .delete_container(&container.node, container.vmid, purge)
        .await?;
    info!("Destroyed CT {} ({}) on {}", container.vmid, container.name, container.node);
    Ok(())
}
