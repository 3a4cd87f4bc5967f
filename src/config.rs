//! Environment settings and YAML container definitions.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{
    ContainerSpec, DeviceRequest, FeatureFlags, MountRequest, NetworkConfig,
};
use crate::overlay::TailscaleAuth;
use crate::provision::ProvisioningPlan;
use crate::proxmox::ProxmoxAuth;
use crate::shell::SshCredentials;

const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;

/// `~/.pxrun`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("could not find home directory".to_string()))?;
    Ok(home.join(".pxrun"))
}

/// Loads `~/.pxrun/.env`, then `./.env`. Variables already set win.
pub fn load_env_files() {
    if let Ok(dir) = config_dir() {
        let path = dir.join(".env");
        if dotenvy::from_path(&path).is_ok() {
            debug!("Loaded {}", path.display());
        }
    }
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded {}", path.display());
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub proxmox: ProxmoxAuth,
    /// Management API credentials; when set every join key is issued fresh.
    pub tailscale: Option<TailscaleAuth>,
    pub tailscale_auth_key: Option<String>,
    pub ssh: SshCredentials,
    pub ready_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any variable source. Every missing required
    /// variable is reported in one error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &'static str| {
            let value = get(key);
            if value.is_none() {
                missing.push(key);
            }
            value.unwrap_or_default()
        };
        let host = required("PROXMOX_HOST");
        let token_id = required("PROXMOX_TOKEN_ID");
        let token_secret = required("PROXMOX_TOKEN_SECRET");
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing environment variables: {}",
                missing.join(", ")
            )));
        }

        let verify_ssl = match get("PROXMOX_VERIFY_SSL") {
            Some(v) => parse_bool("PROXMOX_VERIFY_SSL", &v)?,
            None => false,
        };

        let tailscale = tailscale_auth(&get)?;

        let mut ssh = SshCredentials::default();
        if let Some(user) = get("PXRUN_SSH_USER") {
            ssh.user = user;
        }
        ssh.identity_file = get("PXRUN_SSH_KEY").map(|p| expand_home(&p));
        if let Some(port) = get("PXRUN_SSH_PORT") {
            ssh.port = port
                .parse()
                .map_err(|_| Error::Config(format!("PXRUN_SSH_PORT is not a port: {port}")))?;
        }
        if let Some(hosts) = get("PXRUN_SSH_HOSTS") {
            ssh.host_overrides = parse_host_overrides(&hosts)?;
        }

        let ready_timeout = match get("PXRUN_READY_TIMEOUT") {
            Some(secs) => Duration::from_secs(secs.parse().map_err(|_| {
                Error::Config(format!("PXRUN_READY_TIMEOUT is not a number of seconds: {secs}"))
            })?),
            None => Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        };

        Ok(Self {
            proxmox: ProxmoxAuth::new(&host, &token_id, &token_secret, verify_ssl),
            tailscale,
            tailscale_auth_key: get("TAILSCALE_AUTH_KEY"),
            ssh,
            ready_timeout,
        })
    }
}

/// Overlay management credentials alone, for commands that never touch the
/// cluster.
pub fn tailscale_from_env() -> Result<Option<TailscaleAuth>> {
    tailscale_auth(&|key: &str| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn tailscale_auth(get: &dyn Fn(&str) -> Option<String>) -> Result<Option<TailscaleAuth>> {
    match (get("TAILSCALE_API_KEY"), get("TAILSCALE_TAILNET")) {
        (Some(api_key), Some(tailnet)) => Ok(Some(TailscaleAuth { api_key, tailnet })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(Error::Config(
            "TAILSCALE_API_KEY is set but TAILSCALE_TAILNET is missing".to_string(),
        )),
        (None, Some(_)) => Err(Error::Config(
            "TAILSCALE_TAILNET is set but TAILSCALE_API_KEY is missing".to_string(),
        )),
    }
}

/// `PXRUN_LOG_DIR`, else `~/.pxrun/logs`, else `./logs`.
pub fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var("PXRUN_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        return expand_home(dir.trim());
    }
    config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|_| PathBuf::from("./logs"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} is not a boolean: {value}"))),
    }
}

/// Parses `node=address,node2=address2`.
pub fn parse_host_overrides(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((node, addr)) if !node.trim().is_empty() && !addr.trim().is_empty() => {
                Ok((node.trim().to_string(), addr.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "PXRUN_SSH_HOSTS entry must be node=address: {entry}"
            ))),
        })
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// A container definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerFile {
    pub hostname: String,
    pub template: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default = "default_true")]
    pub unprivileged: bool,
    #[serde(default)]
    pub start_on_boot: bool,
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
    #[serde(default)]
    pub devices: Vec<DeviceRequest>,
    #[serde(default)]
    pub provisioning: ProvisioningPlan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resources {
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// MiB
    #[serde(default = "default_memory")]
    pub memory: u64,
    /// MiB
    #[serde(default = "default_swap")]
    pub swap: u64,
    /// GiB
    #[serde(default = "default_disk")]
    pub disk: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            memory: default_memory(),
            swap: default_swap(),
            disk: default_disk(),
        }
    }
}

fn default_storage_pool() -> String {
    "local-lvm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cores() -> u32 {
    2
}

fn default_memory() -> u64 {
    1024
}

fn default_swap() -> u64 {
    512
}

fn default_disk() -> u64 {
    10
}

/// Command-line values that replace those of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub hostname: Option<String>,
    pub node: Option<String>,
    pub template: Option<String>,
    pub cores: Option<u32>,
    /// MB.
    pub memory: Option<u64>,
    /// Root disk in GB.
    pub disk: Option<u64>,
    pub storage_pool: Option<String>,
    pub network_bridge: Option<String>,
    /// `dhcp` or a CIDR address.
    pub ip: Option<String>,
    pub gateway: Option<String>,
    /// Added to the keys listed in the file.
    pub ssh_keys: Vec<String>,
    /// Drop every provisioning step, including the Tailscale join.
    pub skip_provisioning: bool,
}

impl ContainerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: ContainerFile = serde_yaml::from_str(&content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Config("hostname must not be empty".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(Error::Config("template must not be empty".to_string()));
        }
        if self.resources.cores == 0 || self.resources.memory == 0 || self.resources.disk == 0 {
            return Err(Error::Config(
                "cores, memory and disk must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn into_spec(self, overrides: &Overrides) -> ContainerSpec {
        let hostname = overrides.hostname.clone().unwrap_or(self.hostname);
        let template = overrides.template.clone().unwrap_or(self.template);
        let storage_pool = overrides.storage_pool.clone().unwrap_or(self.storage_pool);

        let mut spec = ContainerSpec::new(hostname, template, storage_pool);
        spec.vmid = self.vmid;
        spec.node = overrides.node.clone().or(self.node);
        spec.cores = overrides.cores.unwrap_or(self.resources.cores);
        spec.memory_mb = overrides.memory.unwrap_or(self.resources.memory);
        spec.swap_mb = self.resources.swap;
        spec.disk_gb = overrides.disk.unwrap_or(self.resources.disk);

        let mut network = self.network.unwrap_or_default();
        if let Some(bridge) = &overrides.network_bridge {
            network.bridge = bridge.clone();
        }
        if let Some(ip) = &overrides.ip {
            network.ip = ip.clone();
        }
        if let Some(gateway) = &overrides.gateway {
            network.gateway = Some(gateway.clone());
        }
        spec.network = network;
        spec.features = self.features;
        spec.unprivileged = self.unprivileged;
        spec.start_on_boot = self.start_on_boot;
        spec.mounts = self.mounts;
        spec.devices = self.devices;
        if !overrides.skip_provisioning {
            spec.steps = self.provisioning.steps(&spec.hostname);
            spec.overlay = self.provisioning.overlay_request();
        }
        spec.ssh_public_keys = self.provisioning.ssh_keys;
        spec.ssh_public_keys.extend(overrides.ssh_keys.iter().cloned());
        spec
    }
}
