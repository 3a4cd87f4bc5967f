use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Template {template} not available on {node}")]
    TemplateMissing { template: String, node: String },

    #[error("Container id allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Container creation failed: {0}")]
    CreationFailed(String),

    #[error("Container {vmid} not ready after {attempts} attempts in {waited:?}: {last_error}")]
    ContainerNotReady {
        vmid: u32,
        attempts: u32,
        waited: Duration,
        last_error: String,
    },

    #[error("Remote shell channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Authentication rejected by {host}: {detail}")]
    AuthRejected { host: String, detail: String },

    #[error("Step '{name}' failed with exit code {exit_code:?}: {stderr}")]
    StepFailed {
        name: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Step '{name}' timed out after {timeout:?}")]
    StepTimedOut { name: String, timeout: Duration },

    #[error("No overlay auth key available: configure TAILSCALE_API_KEY/TAILSCALE_TAILNET or TAILSCALE_AUTH_KEY")]
    NoAuthKeyAvailable,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Task error: {0}")]
    Task(String),

    #[error("Task {upid} still running after {waited:?}")]
    TaskPending { upid: String, waited: Duration },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Errors that must never be retried automatically, not even by the
    /// readiness poll or a channel reopen.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Error::AuthRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
