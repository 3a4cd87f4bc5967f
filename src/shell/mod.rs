mod capture;
mod ssh;

pub use capture::{drain, BoundedBuffer, OutputBudget, OUTPUT_CAP};
pub use ssh::{SshChannel, SshConnector, SshCredentials};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::models::ExecutionResult;

/// A command for a remote shell, with its hard wall-clock limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Name recorded in the result and in logs. The command text itself is
    /// never logged since it may carry secrets in its environment.
    pub label: String,
    pub command: String,
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(label: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            timeout,
        }
    }
}

/// Authenticated shell session on a cluster node.
///
/// Commands run one at a time, which `&mut self` enforces. After a command
/// times out the channel is closed for good: the remote process may still be
/// running and its state is unknown. Open a new channel to continue.
#[async_trait]
pub trait ShellChannel: Send {
    fn is_open(&self) -> bool;

    /// Runs the command. `Ok` carries ok/failed/timed-out results; `Err` means
    /// the channel itself broke (`ChannelUnavailable`, `AuthRejected`).
    async fn run(&mut self, command: &RemoteCommand) -> Result<ExecutionResult>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connects and authenticates. `connect_timeout` bounds the whole open.
    async fn open(&self, node: &str, connect_timeout: Duration) -> Result<Box<dyn ShellChannel>>;
}
