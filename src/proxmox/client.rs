use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::ControlPlane;
use crate::error::{Error, Result};
use crate::models::{ContainerSpec, ContainerSummary, NodeInfo};

const CREATE_TASK_TIMEOUT: Duration = Duration::from_secs(120);
const START_TASK_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const DELETE_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ProxmoxAuth {
    /// Host with optional port, no scheme.
    pub host: String,
    /// `user@realm!tokenname`
    pub token_id: String,
    pub token_secret: String,
    pub verify_ssl: bool,
}

impl ProxmoxAuth {
    pub fn new(host: &str, token_id: &str, token_secret: &str, verify_ssl: bool) -> Self {
        let host = host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self {
            host,
            token_id: token_id.to_string(),
            token_secret: token_secret.to_string(),
            verify_ssl,
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://{}/api2/json", self.host)
    }

    fn authorization(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    node: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    maxcpu: u32,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    maxmem: u64,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    storage: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_active")]
    active: u8,
}

fn default_active() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
struct RawContent {
    volid: String,
}

#[derive(Debug, Deserialize)]
struct RawTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    vmid: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    version: String,
}

#[derive(Debug, Deserialize)]
struct RawContainerStatus {
    status: String,
}

/// The next-id endpoint answers with a string on most releases and a number
/// on some.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u32),
}

pub struct ProxmoxClient {
    client: Client,
    auth: ProxmoxAuth,
}

impl ProxmoxClient {
    pub fn new(auth: ProxmoxAuth) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!auth.verify_ssl)
            .build()?;

        Ok(Self { client, auth })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.auth.base_url(), path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth.authorization())
            .send()
            .await?;
        read_data(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, params: &[(String, String)]) -> Result<T> {
        debug!("POST {}", path);
        let response = self
            .client
            .post(self.url(path))
            .header("Authorization", self.auth.authorization())
            .form(params)
            .send()
            .await?;
        read_data(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("DELETE {}", path);
        let response = self
            .client
            .delete(self.url(path))
            .header("Authorization", self.auth.authorization())
            .send()
            .await?;
        read_data(response).await
    }

    async fn node_storage(&self, node: &str) -> Result<(Vec<String>, Vec<String>)> {
        let storages: Vec<RawStorage> = self.get(&format!("/nodes/{node}/storage")).await?;
        let mut pools = Vec::new();
        let mut templates = Vec::new();

        for storage in storages.into_iter().filter(|s| s.active == 1) {
            if storage.content.split(',').any(|c| c == "vztmpl") {
                let path = format!("/nodes/{node}/storage/{}/content?content=vztmpl", storage.storage);
                match self.get::<Vec<RawContent>>(&path).await {
                    Ok(items) => templates.extend(items.into_iter().map(|i| i.volid)),
                    Err(e) => warn!("Failed to list templates in {} on {}: {}", storage.storage, node, e),
                }
            }
            pools.push(storage.storage);
        }

        Ok((pools, templates))
    }

    /// Polls a task until it stops. A task that stops with anything other
    /// than `OK` is an error carrying the exit status; one still running at
    /// `timeout` is `TaskPending`.
    pub async fn wait_for_task(&self, node: &str, upid: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let status: RawTaskStatus = self.get(&format!("/nodes/{node}/tasks/{upid}/status")).await?;
            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(Error::Task(format!(
                        "{upid} failed: {}",
                        other.unwrap_or("unknown error")
                    ))),
                };
            }
            if started.elapsed() >= timeout {
                return Err(Error::TaskPending {
                    upid: upid.to_string(),
                    waited: started.elapsed(),
                });
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn container_status(&self, node: &str, vmid: u32) -> Result<String> {
        let status: RawContainerStatus = self
            .get(&format!("/nodes/{node}/lxc/{vmid}/status/current"))
            .await?;
        Ok(status.status)
    }
}

#[async_trait]
impl ControlPlane for ProxmoxClient {
    async fn version(&self) -> Result<String> {
        let version: RawVersion = self.get("/version").await?;
        info!("Connected to Proxmox VE {}", version.version);
        Ok(version.version)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let raw: Vec<RawNode> = self.get("/nodes").await?;
        let mut nodes = Vec::with_capacity(raw.len());

        for raw in raw {
            let mut node = node_from_raw(raw);
            if node.online {
                match self.node_storage(&node.name).await {
                    Ok((pools, templates)) => {
                        node.storage_pools = pools;
                        node.templates = templates;
                    }
                    Err(e) => warn!("Failed to list storage on {}: {}", node.name, e),
                }
            }
            nodes.push(node);
        }

        Ok(nodes)
    }

    async fn allocate_id(&self, candidate: Option<u32>) -> Result<u32> {
        let path = match candidate {
            Some(vmid) => format!("/cluster/nextid?vmid={vmid}"),
            None => "/cluster/nextid".to_string(),
        };
        let id: RawId = self.get(&path).await?;
        match id {
            RawId::Number(n) => Ok(n),
            RawId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::AllocationFailed(format!("unexpected next id '{s}'"))),
        }
    }

    async fn create_container(&self, node: &str, vmid: u32, spec: &ContainerSpec) -> Result<()> {
        let params = create_params(vmid, spec);
        let upid: String = self.post(&format!("/nodes/{node}/lxc"), &params).await?;
        info!("Container creation started: vmid={} task={}", vmid, upid);
        self.wait_for_task(node, &upid, CREATE_TASK_TIMEOUT).await
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<()> {
        let upid: String = self
            .post(&format!("/nodes/{node}/lxc/{vmid}/status/start"), &[])
            .await?;
        self.wait_for_task(node, &upid, START_TASK_TIMEOUT).await?;
        info!("Started container {} on {}", vmid, node);
        Ok(())
    }

    async fn delete_container(&self, node: &str, vmid: u32, purge: bool) -> Result<()> {
        if self.container_status(node, vmid).await? == "running" {
            let upid: String = self
                .post(&format!("/nodes/{node}/lxc/{vmid}/status/stop"), &[])
                .await?;
            self.wait_for_task(node, &upid, STOP_TASK_TIMEOUT).await?;
            info!("Stopped container {} on {}", vmid, node);
        }

        let purge = if purge { 1 } else { 0 };
        let upid: String = self
            .delete(&format!("/nodes/{node}/lxc/{vmid}?purge={purge}"))
            .await?;
        self.wait_for_task(node, &upid, DELETE_TASK_TIMEOUT).await?;
        info!("Destroyed container {} on {}", vmid, node);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let resources: Vec<RawResource> = self.get("/cluster/resources?type=vm").await?;
        Ok(containers_from_resources(resources))
    }
}

async fn read_data<T: DeserializeOwned>(response: Response) -> Result<T> {
    match response.status() {
        StatusCode::OK => {
            let body = response.json::<ApiResponse<T>>().await?;
            Ok(body.data)
        }
        StatusCode::UNAUTHORIZED => Err(Error::Api {
            status: 401,
            message: "Unauthorized - check PROXMOX_TOKEN_ID and PROXMOX_TOKEN_SECRET".to_string(),
        }),
        status => {
            let reason = status.canonical_reason().unwrap_or("").to_string();
            let text = response.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() || text.trim() == "{\"data\":null}" {
                reason
            } else {
                text
            };
            Err(Error::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn node_from_raw(raw: RawNode) -> NodeInfo {
    NodeInfo {
        online: raw.status == "online",
        name: raw.node,
        cpu_usage: raw.cpu,
        cores: raw.maxcpu,
        mem_used: raw.mem,
        mem_total: raw.maxmem,
        storage_pools: Vec::new(),
        templates: Vec::new(),
    }
}

fn containers_from_resources(resources: Vec<RawResource>) -> Vec<ContainerSummary> {
    resources
        .into_iter()
        .filter(|r| r.kind == "lxc")
        .filter_map(|r| {
            let vmid = r.vmid?;
            Some(ContainerSummary {
                vmid,
                name: r.name.unwrap_or_else(|| format!("ct{vmid}")),
                node: r.node?,
                status: r.status.unwrap_or_else(|| "unknown".to_string()),
            })
        })
        .collect()
}

/// Form parameters for `POST /nodes/{node}/lxc`. The container is created
/// stopped; starting it is a separate step.
pub fn create_params(vmid: u32, spec: &ContainerSpec) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = vec![
        ("vmid".into(), vmid.to_string()),
        ("hostname".into(), spec.hostname.clone()),
        ("ostemplate".into(), spec.template_volid()),
        ("cores".into(), spec.cores.to_string()),
        ("memory".into(), spec.memory_mb.to_string()),
        ("swap".into(), spec.swap_mb.to_string()),
        ("rootfs".into(), format!("{}:{}", spec.storage_pool, spec.disk_gb)),
        ("net0".into(), spec.network.to_net0()),
        ("unprivileged".into(), bool_param(spec.unprivileged)),
        ("onboot".into(), bool_param(spec.start_on_boot)),
        ("start".into(), "0".into()),
    ];

    if let Some(features) = spec.features.to_param() {
        params.push(("features".into(), features));
    }
    for (i, mount) in spec.mounts.iter().enumerate() {
        params.push((format!("mp{i}"), mount.to_param()));
    }
    for (i, device) in spec.devices.iter().enumerate() {
        params.push((format!("dev{i}"), device.path.clone()));
    }
    if !spec.ssh_public_keys.is_empty() {
        params.push(("ssh-public-keys".into(), spec.ssh_public_keys.join("\n")));
    }

    params
}

fn bool_param(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceRequest, MountRequest};

    #[test]
    fn auth_strips_scheme_and_builds_token_header() {
        let auth = ProxmoxAuth::new("https://pve.example.com:8006/", "root@pam!pxrun", "s3cret", false);
        assert_eq!(auth.base_url(), "https://pve.example.com:8006/api2/json");
        assert_eq!(auth.authorization(), "PVEAPIToken=root@pam!pxrun=s3cret");
    }

    #[test]
    fn parses_node_listing() {
        let body = r#"{"data":[
            {"node":"pve1","status":"online","cpu":0.25,"maxcpu":8,"mem":4096,"maxmem":16384},
            {"node":"pve2","status":"offline"}
        ]}"#;
        let raw: ApiResponse<Vec<RawNode>> = serde_json::from_str(body).unwrap();
        let nodes: Vec<NodeInfo> = raw.data.into_iter().map(node_from_raw).collect();

        assert_eq!(nodes[0].name, "pve1");
        assert!(nodes[0].online);
        assert_eq!(nodes[0].cores, 8);
        assert!((nodes[0].load_score() - 0.5).abs() < f64::EPSILON);
        assert!(!nodes[1].online);
    }

    #[test]
    fn next_id_accepts_text_or_number() {
        let text: ApiResponse<RawId> = serde_json::from_str(r#"{"data":"105"}"#).unwrap();
        assert!(matches!(text.data, RawId::Text(ref s) if s == "105"));
        let number: ApiResponse<RawId> = serde_json::from_str(r#"{"data":106}"#).unwrap();
        assert!(matches!(number.data, RawId::Number(106)));
    }

    #[test]
    fn cluster_resources_keep_only_containers() {
        let body = r#"{"data":[
            {"type":"lxc","vmid":101,"name":"web1","node":"pve1","status":"running"},
            {"type":"qemu","vmid":200,"name":"vm","node":"pve1","status":"stopped"},
            {"type":"lxc","vmid":102,"node":"pve2","status":"stopped"}
        ]}"#;
        let raw: ApiResponse<Vec<RawResource>> = serde_json::from_str(body).unwrap();
        let containers = containers_from_resources(raw.data);

        assert_eq!(containers.len(), 2);
        assert!(containers[0].is_running());
        assert_eq!(containers[1].name, "ct102");
    }

    #[test]
    fn create_params_cover_mounts_devices_and_keys() {
        let mut spec = ContainerSpec::new("web1", "local:vztmpl/debian.tar.zst", "local-lvm");
        spec.disk_gb = 16;
        spec.features.nesting = true;
        spec.mounts.push(MountRequest {
            source: "/srv/data".into(),
            target: "/data".into(),
            read_only: true,
        });
        spec.devices.push(DeviceRequest { path: "/dev/net/tun".into() });
        spec.ssh_public_keys = vec!["ssh-ed25519 AAA a".into(), "ssh-ed25519 BBB b".into()];

        let params = create_params(101, &spec);
        let get = |k: &str| params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("vmid"), Some("101"));
        assert_eq!(get("rootfs"), Some("local-lvm:16"));
        assert_eq!(get("features"), Some("nesting=1"));
        assert_eq!(get("mp0"), Some("/srv/data,mp=/data,ro=1"));
        assert_eq!(get("dev0"), Some("/dev/net/tun"));
        assert_eq!(get("ssh-public-keys"), Some("ssh-ed25519 AAA a\nssh-ed25519 BBB b"));
        assert_eq!(get("start"), Some("0"));
    }
}
