use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{KeyRequest, OverlayDirectory};
use crate::error::{Error, Result};
use crate::models::OverlayIdentity;

const BASE_URL: &str = "https://api.tailscale.com/api/v2";
const KEY_EXPIRY_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct TailscaleAuth {
    pub api_key: String,
    pub tailnet: String,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    #[serde(default)]
    id: String,
    #[serde(default)]
    node_id: String,
    /// FQDN, e.g. `web1.tail1234.ts.net`.
    #[serde(default)]
    name: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    os: String,
    #[serde(default)]
    last_seen: Option<String>,
    #[serde(default)]
    connected_to_control: Option<bool>,
    #[serde(default)]
    online: Option<bool>,
}

impl From<RawDevice> for OverlayIdentity {
    fn from(raw: RawDevice) -> Self {
        let id = if raw.id.is_empty() { raw.node_id } else { raw.id };
        OverlayIdentity {
            id,
            name: raw.hostname,
            fqdn: raw.name,
            addresses: raw.addresses,
            online: raw.online.or(raw.connected_to_control).unwrap_or(false),
            os: raw.os,
            last_seen: raw.last_seen,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    capabilities: KeyCapabilities,
    expiry_seconds: u64,
    description: String,
}

#[derive(Debug, Serialize)]
struct KeyCapabilities {
    devices: DeviceCapabilities,
}

#[derive(Debug, Serialize)]
struct DeviceCapabilities {
    create: CreateCapability,
}

#[derive(Debug, Serialize)]
struct CreateCapability {
    reusable: bool,
    ephemeral: bool,
    preauthorized: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl From<&KeyRequest> for CreateKeyRequest {
    fn from(req: &KeyRequest) -> Self {
        Self {
            capabilities: KeyCapabilities {
                devices: DeviceCapabilities {
                    create: CreateCapability {
                        reusable: req.persistent,
                        ephemeral: !req.persistent,
                        preauthorized: true,
                        tags: req.tags.clone(),
                    },
                },
            },
            expiry_seconds: KEY_EXPIRY_SECONDS,
            description: req.description.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateKeyResponse {
    #[serde(default)]
    id: String,
    key: String,
}

pub struct TailscaleClient {
    client: Client,
    auth: TailscaleAuth,
}

impl TailscaleClient {
    pub fn new(auth: TailscaleAuth) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, auth })
    }
}

#[async_trait]
impl OverlayDirectory for TailscaleClient {
    async fn list_identities(&self) -> Result<Vec<OverlayIdentity>> {
        let url = format!("{BASE_URL}/tailnet/{}/devices?fields=all", self.auth.tailnet);
        debug!("Listing overlay devices: {}", url);

        let response = self.client.get(&url).bearer_auth(&self.auth.api_key).send().await?;
        let body: DevicesResponse = check(response).await?.json().await?;
        let identities: Vec<OverlayIdentity> = body.devices.into_iter().map(Into::into).collect();

        info!("Retrieved {} devices from tailnet", identities.len());
        Ok(identities)
    }

    async fn remove_identity(&self, id: &str) -> Result<()> {
        let url = format!("{BASE_URL}/device/{id}");
        let response = self.client.delete(&url).bearer_auth(&self.auth.api_key).send().await?;
        check(response).await?;

        info!("Removed device {} from tailnet", id);
        Ok(())
    }

    async fn issue_key(&self, request: &KeyRequest) -> Result<String> {
        let url = format!("{BASE_URL}/tailnet/{}/keys", self.auth.tailnet);
        let body = CreateKeyRequest::from(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.auth.api_key)
            .json(&body)
            .send()
            .await?;
        let created: CreateKeyResponse = check(response).await?.json().await?;

        info!(
            "Issued auth key {} ({}, {})",
            created.id,
            request.description,
            if request.persistent { "persistent" } else { "ephemeral" }
        );
        Ok(created.key)
    }
}

async fn check(response: Response) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Api {
            status: response.status().as_u16(),
            message: "Unauthorized - check TAILSCALE_API_KEY and TAILSCALE_TAILNET".to_string(),
        }),
        status => {
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            Err(Error::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}
