//! In-memory stand-ins for the cluster, the node shells and the overlay
//! directory.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pxrun::error::{Error, Result};
use pxrun::models::{
    ContainerSpec, ContainerSummary, ExecutionResult, NodeInfo, NodeInventory, OverlayIdentity,
    ProvisioningStep, StepOutcome,
};
use pxrun::overlay::{KeyRequest, OverlayDirectory};
use pxrun::proxmox::ControlPlane;
use pxrun::shell::{RemoteCommand, ShellChannel, ShellConnector};

pub const TEMPLATE: &str = "local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst";
pub const POOL: &str = "local-lvm";
pub const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Fixtures
// =============================================================================

pub fn node(name: &str, cpu: f64, mem_used_gib: u64, mem_total_gib: u64) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        online: true,
        cpu_usage: cpu,
        cores: 16,
        mem_used: mem_used_gib * GIB,
        mem_total: mem_total_gib * GIB,
        storage_pools: vec!["local".to_string(), POOL.to_string()],
        templates: vec![TEMPLATE.to_string()],
    }
}

pub fn inventory(nodes: Vec<NodeInfo>) -> NodeInventory {
    NodeInventory::from_nodes(nodes)
}

pub fn spec(hostname: &str) -> ContainerSpec {
    ContainerSpec::new(hostname, TEMPLATE, POOL)
}

pub fn spec_with_steps(hostname: &str, steps: Vec<ProvisioningStep>) -> ContainerSpec {
    let mut spec = spec(hostname);
    spec.steps = steps;
    spec
}

pub fn identity(id: &str, name: &str, fqdn: &str) -> OverlayIdentity {
    OverlayIdentity {
        id: id.to_string(),
        name: name.to_string(),
        fqdn: fqdn.to_string(),
        addresses: vec!["100.64.0.1".to_string()],
        online: true,
        os: "linux".to_string(),
        last_seen: None,
    }
}

pub fn exited(label: &str, code: i32) -> ExecutionResult {
    ExecutionResult {
        name: label.to_string(),
        exit_code: Some(code),
        stdout: String::new(),
        stderr: if code == 0 { String::new() } else { format!("{label}: boom") },
        elapsed: Duration::from_millis(5),
        outcome: if code == 0 { StepOutcome::Ok } else { StepOutcome::Failed },
    }
}

pub fn timed_out(label: &str) -> ExecutionResult {
    ExecutionResult {
        name: label.to_string(),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        elapsed: Duration::from_secs(1),
        outcome: StepOutcome::TimedOut,
    }
}

// =============================================================================
// Control plane
// =============================================================================

#[derive(Default)]
pub struct MockControlPlane {
    pub nodes: Vec<NodeInfo>,
    pub containers: Mutex<Vec<ContainerSummary>>,
    pub next_id: Mutex<u32>,
    /// Answer next-id the way the cluster does: the lowest id from 100 up
    /// that no container holds yet.
    pub lowest_free_id: bool,
    pub fail_allocate: Option<String>,
    pub fail_create: Option<String>,
    /// Accept the create request but never see its task finish.
    pub create_pending: bool,
    pub fail_start: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockControlPlane {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes,
            next_id: Mutex::new(101),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn version(&self) -> Result<String> {
        Ok("8.2.4".to_string())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.record("list_nodes".to_string());
        Ok(self.nodes.clone())
    }

    async fn allocate_id(&self, candidate: Option<u32>) -> Result<u32> {
        self.record(format!("allocate_id {candidate:?}"));
        if let Some(msg) = &self.fail_allocate {
            return Err(Error::Api {
                status: 500,
                message: msg.clone(),
            });
        }
        if self.lowest_free_id && candidate.is_none() {
            let taken: Vec<u32> = self.containers.lock().unwrap().iter().map(|c| c.vmid).collect();
            return Ok((100..).find(|id| !taken.contains(id)).unwrap());
        }
        let mut next = self.next_id.lock().unwrap();
        let id = candidate.unwrap_or(*next);
        *next = id + 1;
        Ok(id)
    }

    async fn create_container(&self, node: &str, vmid: u32, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("create {node} {vmid}"));
        if let Some(msg) = &self.fail_create {
            return Err(Error::Task(msg.clone()));
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.iter().any(|c| c.vmid == vmid) {
            return Err(Error::Api {
                status: 500,
                message: format!("CT {vmid} already exists"),
            });
        }
        containers.push(ContainerSummary {
            vmid,
            name: spec.hostname.clone(),
            node: node.to_string(),
            status: "stopped".to_string(),
        });
        if self.create_pending {
            return Err(Error::TaskPending {
                upid: format!("UPID:{node}:vzcreate:{vmid}"),
                waited: Duration::from_secs(120),
            });
        }
        Ok(())
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<()> {
        self.record(format!("start {node} {vmid}"));
        if let Some(msg) = &self.fail_start {
            return Err(Error::Task(msg.clone()));
        }
        Ok(())
    }

    async fn delete_container(&self, node: &str, vmid: u32, purge: bool) -> Result<()> {
        self.record(format!("delete {node} {vmid} purge={purge}"));
        self.containers.lock().unwrap().retain(|c| c.vmid != vmid);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.containers.lock().unwrap().clone())
    }
}

// =============================================================================
// Remote shell
// =============================================================================

type Responder = dyn Fn(&RemoteCommand) -> Result<ExecutionResult> + Send + Sync;

/// Connector whose channels answer every command through one responder and
/// log the command text.
pub struct MockConnector {
    responder: Arc<Responder>,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub opened: AtomicUsize,
    pub connect_timeouts: Mutex<Vec<Duration>>,
}

impl MockConnector {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RemoteCommand) -> Result<ExecutionResult> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            commands: Arc::new(Mutex::new(Vec::new())),
            opened: AtomicUsize::new(0),
            connect_timeouts: Mutex::new(Vec::new()),
        }
    }

    /// Every command succeeds.
    pub fn succeeding() -> Self {
        Self::new(|cmd| Ok(exited(&cmd.label, 0)))
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn open(&self, node: &str, connect_timeout: Duration) -> Result<Box<dyn ShellChannel>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.connect_timeouts.lock().unwrap().push(connect_timeout);
        Ok(Box::new(MockChannel {
            host: node.to_string(),
            open: true,
            responder: self.responder.clone(),
            commands: self.commands.clone(),
        }))
    }
}

pub struct MockChannel {
    host: String,
    open: bool,
    responder: Arc<Responder>,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ShellChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionResult> {
        if !self.open {
            return Err(Error::ChannelUnavailable(format!("channel to {} is closed", self.host)));
        }
        self.commands.lock().unwrap().push(command.command.clone());
        let result = (self.responder)(command)?;
        if result.outcome == StepOutcome::TimedOut {
            self.open = false;
        }
        Ok(result)
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

// =============================================================================
// Overlay directory
// =============================================================================

#[derive(Default)]
pub struct MockOverlay {
    pub identities: Mutex<Vec<OverlayIdentity>>,
    pub issued: AtomicUsize,
    pub key_requests: Mutex<Vec<KeyRequest>>,
    pub removed: Mutex<Vec<String>>,
}

impl MockOverlay {
    pub fn with_identities(identities: Vec<OverlayIdentity>) -> Self {
        Self {
            identities: Mutex::new(identities),
            ..Default::default()
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OverlayDirectory for MockOverlay {
    async fn list_identities(&self) -> Result<Vec<OverlayIdentity>> {
        Ok(self.identities.lock().unwrap().clone())
    }

    async fn remove_identity(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        self.identities.lock().unwrap().retain(|i| i.id != id);
        Ok(())
    }

    async fn issue_key(&self, request: &KeyRequest) -> Result<String> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.key_requests.lock().unwrap().push(request.clone());
        Ok(format!("tskey-auth-fresh{n}"))
    }
}
