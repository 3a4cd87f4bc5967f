mod auth_key;
mod client;
mod matcher;

pub use auth_key::{sanitize_description, AuthKeyIssuer, AUTH_KEY_ENV, DESCRIPTION_MAX_LEN};
pub use client::{TailscaleAuth, TailscaleClient};
pub use matcher::find_candidate;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::OverlayIdentity;

/// Parameters of a join key issued by the overlay management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub description: String,
    /// Devices joined with the key survive reboots and the key may be used
    /// again; otherwise the device is ephemeral and the key single-use.
    pub persistent: bool,
    pub tags: Vec<String>,
}

/// Overlay network management API.
#[async_trait]
pub trait OverlayDirectory: Send + Sync {
    async fn list_identities(&self) -> Result<Vec<OverlayIdentity>>;

    async fn remove_identity(&self, id: &str) -> Result<()>;

    async fn issue_key(&self, request: &KeyRequest) -> Result<String>;
}
