use tracing::info;

use crate::error::{Error, Result};
use crate::proxmox::ControlPlane;

/// Reserves a container id through the cluster's next-id call. Nothing is
/// remembered locally: other clients allocate from the same pool.
pub async fn allocate(control_plane: &dyn ControlPlane, candidate: Option<u32>) -> Result<u32> {
    match control_plane.allocate_id(candidate).await {
        Ok(vmid) => {
            info!("Allocated container id {}", vmid);
            Ok(vmid)
        }
        Err(Error::AllocationFailed(msg)) => Err(Error::AllocationFailed(msg)),
        Err(e) => Err(Error::AllocationFailed(e.to_string())),
    }
}
