use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
    Ok,
    Failed,
    TimedOut,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Failed => "failed",
            StepOutcome::TimedOut => "timed-out",
            StepOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub name: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub outcome: StepOutcome,
}

impl ExecutionResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            outcome: StepOutcome::Skipped,
        }
    }

    /// A step that never reached the container, e.g. because its channel or
    /// auth key could not be obtained.
    pub fn not_run(name: impl Into<String>, reason: &Error, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: reason.to_string(),
            elapsed,
            outcome: StepOutcome::Failed,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == StepOutcome::Ok
    }

    /// Error describing a failed or timed-out result.
    pub fn to_error(&self, timeout: Duration) -> Option<Error> {
        match self.outcome {
            StepOutcome::Failed => Some(Error::StepFailed {
                name: self.name.clone(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            }),
            StepOutcome::TimedOut => Some(Error::StepTimedOut {
                name: self.name.clone(),
                timeout,
            }),
            StepOutcome::Ok | StepOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeTag {
    Ready,
    CreatedButProvisioningFailed,
    CreationFailed,
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeTag::Ready => "ready",
            OutcomeTag::CreatedButProvisioningFailed => "created-but-provisioning-failed",
            OutcomeTag::CreationFailed => "creation-failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailedStage {
    Selection,
    Allocation,
    Creation,
    /// The create request was accepted but its task had not finished when
    /// pxrun stopped waiting.
    CreationPending,
    Readiness,
    Step(String),
}

impl FailedStage {
    /// Whether the container exists remotely, or may still come to exist,
    /// once the run failed here.
    pub fn container_exists(&self) -> bool {
        matches!(
            self,
            FailedStage::CreationPending | FailedStage::Readiness | FailedStage::Step(_)
        )
    }

    pub fn outcome_tag(&self) -> OutcomeTag {
        match self {
            FailedStage::Readiness | FailedStage::Step(_) => OutcomeTag::CreatedButProvisioningFailed,
            FailedStage::Selection
            | FailedStage::Allocation
            | FailedStage::Creation
            | FailedStage::CreationPending => OutcomeTag::CreationFailed,
        }
    }
}

impl fmt::Display for FailedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedStage::Selection => f.write_str("selection"),
            FailedStage::Allocation => f.write_str("allocation"),
            FailedStage::Creation => f.write_str("creation"),
            FailedStage::CreationPending => f.write_str("creation (task still running)"),
            FailedStage::Readiness => f.write_str("readiness"),
            FailedStage::Step(name) => write!(f, "step '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionState {
    Requested,
    NodeSelected,
    IdCreated,
    Created,
    WaitingReady,
    Provisioning,
    Ready,
    Failed(FailedStage),
}

impl ProvisionState {
    /// The machine only moves forward; every non-terminal state may fail.
    pub fn can_transition_to(&self, target: &ProvisionState) -> bool {
        use ProvisionState::*;
        match (self, target) {
            (Requested, NodeSelected) => true,
            (NodeSelected, IdCreated) => true,
            (IdCreated, Created) => true,
            (Created, WaitingReady) => true,
            (WaitingReady, Provisioning) => true,
            (Provisioning, Ready) => true,

            (Requested, Failed(FailedStage::Selection)) => true,
            (NodeSelected, Failed(FailedStage::Allocation)) => true,
            (IdCreated, Failed(FailedStage::Creation)) => true,
            (IdCreated, Failed(FailedStage::CreationPending)) => true,
            (Created, Failed(FailedStage::Readiness)) => true,
            (WaitingReady, Failed(FailedStage::Readiness)) => true,
            (Provisioning, Failed(FailedStage::Step(_))) => true,

            _ => false,
        }
    }
}

/// Result of one creation attempt. Produced once and handed to the caller.
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub tag: OutcomeTag,
    pub hostname: String,
    pub vmid: Option<u32>,
    pub node: Option<String>,
    pub results: Vec<ExecutionResult>,
    pub trail: Vec<ProvisionState>,
    pub failed_stage: Option<FailedStage>,
    pub error: Option<Error>,
    pub container_exists: bool,
    pub summary: String,
}

impl LifecycleOutcome {
    pub fn is_ready(&self) -> bool {
        self.tag == OutcomeTag::Ready
    }

    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}
