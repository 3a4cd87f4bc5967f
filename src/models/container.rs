use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Validated request for one container. Hostname syntax and numeric ranges are
/// checked before a spec is built; nothing downstream re-validates them.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSpec {
    pub vmid: Option<u32>,
    pub hostname: String,
    pub template: String,
    pub node: Option<String>,
    pub cores: u32,
    pub memory_mb: u64,
    pub swap_mb: u64,
    pub disk_gb: u64,
    pub storage_pool: String,
    pub network: NetworkConfig,
    pub features: FeatureFlags,
    pub unprivileged: bool,
    pub start_on_boot: bool,
    pub mounts: Vec<MountRequest>,
    pub devices: Vec<DeviceRequest>,
    pub ssh_public_keys: Vec<String>,
    pub steps: Vec<ProvisioningStep>,
    pub overlay: Option<OverlayRequest>,
}

impl ContainerSpec {
    pub fn new(hostname: impl Into<String>, template: impl Into<String>, storage_pool: impl Into<String>) -> Self {
        Self {
            vmid: None,
            hostname: hostname.into(),
            template: template.into(),
            node: None,
            cores: 2,
            memory_mb: 1024,
            swap_mb: 512,
            disk_gb: 10,
            storage_pool: storage_pool.into(),
            network: NetworkConfig::default(),
            features: FeatureFlags::default(),
            unprivileged: true,
            start_on_boot: false,
            mounts: Vec::new(),
            devices: Vec::new(),
            ssh_public_keys: Vec::new(),
            steps: Vec::new(),
            overlay: None,
        }
    }

    /// Proxmox `ostemplate` volume id, accepting bare file names stored on
    /// the default `local` template storage.
    pub fn template_volid(&self) -> String {
        if self.template.contains(':') {
            self.template.clone()
        } else {
            format!("local:vztmpl/{}", self.template)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge: String,
    /// `dhcp` or a CIDR address.
    pub ip: String,
    pub gateway: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "vmbr0".to_string(),
            ip: "dhcp".to_string(),
            gateway: None,
        }
    }
}

impl NetworkConfig {
    pub fn is_dhcp(&self) -> bool {
        self.ip.eq_ignore_ascii_case("dhcp")
    }

    /// Renders the `net0` value of the container config.
    pub fn to_net0(&self) -> String {
        let mut net = format!("name=eth0,bridge={},ip={}", self.bridge, self.ip);
        if let Some(gw) = &self.gateway {
            if !self.is_dhcp() {
                net.push_str(&format!(",gw={gw}"));
            }
        }
        net
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub nesting: bool,
    #[serde(default)]
    pub keyctl: bool,
    #[serde(default)]
    pub fuse: bool,
}

impl FeatureFlags {
    /// `features` value, or `None` when no flag is set.
    pub fn to_param(&self) -> Option<String> {
        let flags: Vec<&str> = [
            (self.nesting, "nesting=1"),
            (self.keyctl, "keyctl=1"),
            (self.fuse, "fuse=1"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, s)| *s)
        .collect();

        if flags.is_empty() {
            None
        } else {
            Some(flags.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountRequest {
    pub fn to_param(&self) -> String {
        let mut mp = format!("{},mp={}", self.source, self.target);
        if self.read_only {
            mp.push_str(",ro=1");
        }
        mp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayRequest {
    /// Key from the container definition, used only when no management API
    /// credentials are configured.
    #[serde(default, skip_serializing)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One unit of post-creation work, executed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningStep {
    pub name: String,
    pub interpreter: String,
    pub script: String,
    pub run_as: String,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
    pub continue_on_error: bool,
    /// The step joins the overlay network and receives `TS_AUTHKEY`.
    pub overlay_join: bool,
}

impl ProvisioningStep {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interpreter: "sh".to_string(),
            script: script.into(),
            run_as: "root".to_string(),
            working_dir: None,
            environment: BTreeMap::new(),
            timeout: Duration::from_secs(300),
            continue_on_error: false,
            overlay_join: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.continue_on_error = yes;
        self
    }

    pub fn joins_overlay(mut self) -> Self {
        self.overlay_join = true;
        self
    }
}

/// Container row as listed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub status: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}
