use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture::{drain, OutputBudget, OUTPUT_CAP};
use super::{RemoteCommand, ShellChannel, ShellConnector};
use crate::error::{Error, Result};
use crate::models::{ExecutionResult, StepOutcome};

/// OpenSSH reserves this exit status for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;
const CONTROL_PERSIST_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub user: String,
    /// Private key file handed to `ssh -i`. Never read by pxrun itself.
    pub identity_file: Option<PathBuf>,
    pub port: u16,
    /// Node name → address, for nodes whose names do not resolve.
    pub host_overrides: HashMap<String, String>,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            identity_file: None,
            port: 22,
            host_overrides: HashMap::new(),
        }
    }
}

impl SshCredentials {
    pub fn address_for(&self, node: &str) -> String {
        self.host_overrides
            .get(node)
            .cloned()
            .unwrap_or_else(|| node.to_string())
    }
}

pub struct SshConnector {
    credentials: SshCredentials,
    control_dir: PathBuf,
    program: Vec<String>,
}

impl SshConnector {
    pub fn new(credentials: SshCredentials) -> Self {
        Self {
            credentials,
            control_dir: std::env::temp_dir(),
            program: vec!["ssh".to_string()],
        }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open(&self, node: &str, connect_timeout: Duration) -> Result<Box<dyn ShellChannel>> {
        let address = self.credentials.address_for(node);
        // Unix socket paths are short; keep the name compact.
        let socket = format!("pxrun-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let mut channel = SshChannel {
            host: address,
            credentials: self.credentials.clone(),
            control_path: self.control_dir.join(socket),
            connect_timeout,
            program: self.program.clone(),
            open: true,
        };

        let check = RemoteCommand::new("connect", "true", connect_timeout);
        let result = channel.run(&check).await?;
        match result.outcome {
            StepOutcome::Ok => {
                info!("Opened shell channel to {} ({})", node, channel.host);
                Ok(Box::new(channel))
            }
            StepOutcome::TimedOut => Err(Error::ChannelUnavailable(format!(
                "connection to {} timed out after {:?}",
                channel.host, connect_timeout
            ))),
            _ => {
                channel.close().await;
                Err(Error::ChannelUnavailable(format!(
                    "connect check on {} exited with {:?}: {}",
                    channel.host,
                    result.exit_code,
                    result.stderr.trim()
                )))
            }
        }
    }
}

/// Channel multiplexed over one OpenSSH control master, so every command
/// after the first reuses the authenticated connection.
pub struct SshChannel {
    host: String,
    credentials: SshCredentials,
    control_path: PathBuf,
    connect_timeout: Duration,
    /// `ssh` plus any leading arguments.
    program: Vec<String>,
    open: bool,
}

impl SshChannel {
    fn ssh(&self) -> Command {
        let mut cmd = Command::new(&self.program[0]);
        cmd.args(&self.program[1..]);
        cmd
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={CONTROL_PERSIST_SECS}"),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.credentials.port.to_string(),
        ];
        if let Some(key) = &self.credentials.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.credentials.user, self.host));
        args
    }

    /// `ssh -O <operation>` against this channel's control master.
    fn control(&self, operation: &str) -> Command {
        let mut cmd = self.ssh();
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg(operation)
            .arg(format!("{}@{}", self.credentials.user, self.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Whether the control master still holds an authenticated connection.
    /// Exit 255 from a command run through a live master is the command's
    /// own status.
    async fn master_alive(&self) -> bool {
        match timeout(Duration::from_secs(5), self.control("check").status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!("Failed to check control master for {}: {}", self.host, e);
                false
            }
            Err(_) => false,
        }
    }

    async fn shutdown_master(&self) {
        match timeout(Duration::from_secs(5), self.control("exit").status()).await {
            Ok(Ok(_)) => debug!("Closed control master for {}", self.host),
            Ok(Err(e)) => warn!("Failed to close control master for {}: {}", self.host, e),
            Err(_) => warn!("Timed out closing control master for {}", self.host),
        }
    }
}

#[async_trait]
impl ShellChannel for SshChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionResult> {
        if !self.open {
            return Err(Error::ChannelUnavailable(format!(
                "channel to {} is closed",
                self.host
            )));
        }

        debug!("Running '{}' on {}", command.label, self.host);
        let started = Instant::now();

        let mut child = self
            .ssh()
            .args(self.base_args())
            .arg("--")
            .arg(&command.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ChannelUnavailable(format!("failed to spawn ssh: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ChannelUnavailable("ssh stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ChannelUnavailable("ssh stderr not captured".to_string()))?;
        let budget = OutputBudget::new(OUTPUT_CAP);
        let stdout_task = tokio::spawn(drain(stdout, budget.clone()));
        let stderr_task = tokio::spawn(drain(stderr, budget));

        let status = match timeout(command.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "'{}' on {} exceeded {:?}; closing channel, remote command may still be running",
                    command.label, self.host, command.timeout
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                let stdout = collect(stdout_task).await;
                let stderr = collect(stderr_task).await;
                self.close().await;
                return Ok(ExecutionResult {
                    name: command.label.clone(),
                    exit_code: None,
                    stdout,
                    stderr,
                    elapsed: started.elapsed(),
                    outcome: StepOutcome::TimedOut,
                });
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let exit_code = status.code();

        if exit_code == Some(SSH_FAILURE_EXIT)
            && looks_like_ssh_failure(&stderr)
            && !self.master_alive().await
        {
            let err = classify_failure(&self.host, &stderr);
            self.close().await;
            return Err(err);
        }

        let outcome = if exit_code == Some(0) {
            StepOutcome::Ok
        } else {
            StepOutcome::Failed
        };
        debug!(
            "'{}' on {} finished: {} (exit {:?}) in {:?}",
            command.label,
            self.host,
            outcome,
            exit_code,
            started.elapsed()
        );

        Ok(ExecutionResult {
            name: command.label.clone(),
            exit_code,
            stdout,
            stderr,
            elapsed: started.elapsed(),
            outcome,
        })
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.shutdown_master().await;
        }
    }
}

async fn collect(task: JoinHandle<std::io::Result<String>>) -> String {
    match timeout(Duration::from_secs(2), task).await {
        Ok(Ok(Ok(text))) => text,
        Ok(Ok(Err(e))) => format!("[output unavailable: {e}]"),
        Ok(Err(e)) => format!("[output unavailable: {e}]"),
        Err(_) => "[output unavailable: stream did not close]".to_string(),
    }
}

fn looks_like_ssh_failure(stderr: &str) -> bool {
    const MARKERS: [&str; 8] = [
        "ssh:",
        "Permission denied",
        "Host key verification failed",
        "Connection refused",
        "Connection timed out",
        "Connection closed",
        "Could not resolve hostname",
        "Too many authentication failures",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

fn classify_failure(host: &str, stderr: &str) -> Error {
    let detail = stderr.trim().lines().last().unwrap_or("ssh failed").to_string();
    if stderr.contains("Permission denied")
        || stderr.contains("Too many authentication failures")
        || stderr.contains("Host key verification failed")
    {
        Error::AuthRejected {
            host: host.to_string(),
            detail,
        }
    } else {
        Error::ChannelUnavailable(format!("{host}: {detail}"))
    }
}
