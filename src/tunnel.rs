//! Runs commands inside a container through the node's container manager.
//!
//! The control-plane API has no exec endpoint for containers, so every
//! command goes over a shell channel to the node and through `pct exec`.
//! Replacing this module is all a native exec API would need.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::budget::OperationBudget;
use crate::error::{Error, Result};
use crate::models::ExecutionResult;
use crate::shell::{RemoteCommand, ShellChannel, ShellConnector};

/// Bounded exponential backoff for the first command after a container
/// starts, absorbing the race between start and container-manager readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
    pub check_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            deadline: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10),
        }
    }
}

impl ReadinessPolicy {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Wraps a command for `pct exec`, quoted for the node's login shell.
pub fn container_command(vmid: u32, interpreter: &str, script: &str) -> String {
    format!(
        "pct exec {vmid} -- {} -c {}",
        shell_words::quote(interpreter),
        shell_words::quote(script)
    )
}

/// Host-side command granting the container the TUN device the overlay agent
/// needs. Idempotent; must run before the container starts.
pub fn overlay_device_command(vmid: u32) -> String {
    let conf = format!("/etc/pve/lxc/{vmid}.conf");
    format!(
        "grep -qF 'c 10:200 rwm' {conf} || printf '%s\\n' \
         'lxc.cgroup2.devices.allow: c 10:200 rwm' \
         'lxc.mount.entry: /dev/net/tun dev/net/tun none bind,create=file' >> {conf}"
    )
}

pub struct ContainerTunnel {
    connector: Arc<dyn ShellConnector>,
    node: String,
    connect_timeout: Duration,
    channel: Option<Box<dyn ShellChannel>>,
}

impl ContainerTunnel {
    pub async fn open(
        connector: Arc<dyn ShellConnector>,
        node: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let channel = connector.open(node, connect_timeout).await?;
        Ok(Self {
            connector,
            node: node.to_string(),
            connect_timeout,
            channel: Some(channel),
        })
    }

    /// The current channel, or a fresh one when the last command timed out
    /// and closed it. A fresh channel gets at most `connect_limit` to connect.
    async fn channel(&mut self, connect_limit: Duration) -> Result<&mut Box<dyn ShellChannel>> {
        let reopen = self.channel.as_ref().map_or(true, |c| !c.is_open());
        if reopen {
            info!("Opening new shell channel to {}", self.node);
            self.channel = Some(self.connector.open(&self.node, connect_limit).await?);
        }
        self.channel
            .as_mut()
            .ok_or_else(|| Error::ChannelUnavailable(format!("no channel to {}", self.node)))
    }

    pub async fn run_on_host(
        &mut self,
        label: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let command = RemoteCommand::new(label, command, timeout);
        let connect_limit = self.connect_timeout;
        self.channel(connect_limit).await?.run(&command).await
    }

    /// Runs `script` with `interpreter` inside container `vmid`. The exit
    /// status of `pct exec` is the script's own, so it maps directly to the
    /// result outcome.
    pub async fn exec(
        &mut self,
        vmid: u32,
        label: &str,
        interpreter: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let connect_limit = self.connect_timeout;
        self.exec_within(vmid, label, interpreter, script, timeout, connect_limit)
            .await
    }

    async fn exec_within(
        &mut self,
        vmid: u32,
        label: &str,
        interpreter: &str,
        script: &str,
        timeout: Duration,
        connect_limit: Duration,
    ) -> Result<ExecutionResult> {
        let command = RemoteCommand::new(label, container_command(vmid, interpreter, script), timeout);
        let result = self.channel(connect_limit).await?.run(&command).await?;
        if !result.is_ok() {
            debug!(
                "'{}' in CT {} ended {} (exit {:?})",
                label, vmid, result.outcome, result.exit_code
            );
        }
        Ok(result)
    }

    pub async fn prepare_overlay_device(&mut self, vmid: u32) -> Result<()> {
        let result = self
            .run_on_host("overlay-device", &overlay_device_command(vmid), Duration::from_secs(30))
            .await?;
        if result.is_ok() {
            info!("Granted /dev/net/tun to CT {}", vmid);
            Ok(())
        } else {
            Err(Error::ChannelUnavailable(format!(
                "failed to update CT {vmid} config on {}: {}",
                self.node,
                result.stderr.trim()
            )))
        }
    }

    /// Polls until a trivial command succeeds inside the container. Returns
    /// the number of attempts it took.
    pub async fn wait_ready(
        &mut self,
        vmid: u32,
        policy: &ReadinessPolicy,
        budget: &OperationBudget,
    ) -> Result<u32> {
        let started = Instant::now();
        let deadline = budget.clip(policy.deadline);
        let mut delay = policy.initial_delay;
        let mut attempts = 0u32;

        loop {
            budget.check("readiness check")?;
            attempts += 1;

            let remaining = deadline
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(100));
            let check_timeout = policy.check_timeout.min(remaining);
            let connect_limit = self.connect_timeout.min(remaining);

            let attempt = self
                .exec_within(vmid, "readiness", "sh", "true", check_timeout, connect_limit)
                .await;
            let last_error = match attempt {
                Ok(result) if result.is_ok() => {
                    info!("CT {} accepts commands after {} attempt(s)", vmid, attempts);
                    return Ok(attempts);
                }
                Ok(result) => format!(
                    "readiness check {} (exit {:?}): {}",
                    result.outcome,
                    result.exit_code,
                    result.stderr.trim()
                ),
                Err(e) if e.is_auth_rejected() => return Err(e),
                Err(e) => e.to_string(),
            };

            if started.elapsed() + delay > deadline {
                warn!("CT {} not ready: {}", vmid, last_error);
                return Err(Error::ContainerNotReady {
                    vmid,
                    attempts,
                    waited: started.elapsed(),
                    last_error,
                });
            }

            debug!("CT {} not ready yet ({}), retrying in {:?}", vmid, last_error, delay);
            sleep(delay).await;
            delay = (delay * 2).min(policy.max_delay);
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }
}
