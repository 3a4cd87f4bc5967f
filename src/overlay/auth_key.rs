use std::sync::Arc;
use tracing::{debug, info};

use super::{KeyRequest, OverlayDirectory};
use crate::error::{Error, Result};

/// Environment variable the overlay-join step reads its key from.
pub const AUTH_KEY_ENV: &str = "TS_AUTHKEY";

/// Key descriptions longer than this are rejected by the management API.
pub const DESCRIPTION_MAX_LEN: usize = 50;

/// Hands out join keys for containers.
///
/// With management credentials every call issues a new key, even when a
/// static one is configured: static keys expire silently and then break
/// provisioning far from the cause.
pub struct AuthKeyIssuer {
    management: Option<Arc<dyn OverlayDirectory>>,
    static_key: Option<String>,
}

impl AuthKeyIssuer {
    pub fn new(management: Option<Arc<dyn OverlayDirectory>>, static_key: Option<String>) -> Self {
        Self {
            management,
            static_key: static_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn has_management(&self) -> bool {
        self.management.is_some()
    }

    pub async fn ensure_key(
        &self,
        existing: Option<&str>,
        hostname: &str,
        ephemeral: bool,
        tags: &[String],
    ) -> Result<String> {
        if let Some(api) = &self.management {
            let request = KeyRequest {
                description: sanitize_description(&format!("pxrun {hostname}")),
                persistent: !ephemeral,
                tags: tags.to_vec(),
            };
            debug!("Requesting fresh auth key for {}", hostname);
            let key = api.issue_key(&request).await?;
            info!("Using freshly issued auth key for {}", hostname);
            return Ok(key);
        }

        existing
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| self.static_key.clone())
            .ok_or(Error::NoAuthKeyAvailable)
    }
}

/// Keeps ASCII alphanumerics, `-` and spaces, collapses the rest, and
/// truncates to [`DESCRIPTION_MAX_LEN`].
pub fn sanitize_description(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == ' ' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }

    let mut out: String = out.trim().chars().take(DESCRIPTION_MAX_LEN).collect();
    while out.ends_with(' ') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("pxrun");
    }
    out
}
