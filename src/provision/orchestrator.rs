use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{allocator, selector, steps};
use crate::budget::OperationBudget;
use crate::error::{Error, Result};
use crate::models::{
    ContainerSpec, ExecutionResult, FailedStage, LifecycleOutcome, NodeInventory, OutcomeTag,
    ProvisionState, ProvisioningStep, StepOutcome,
};
use crate::overlay::{AuthKeyIssuer, AUTH_KEY_ENV};
use crate::proxmox::ControlPlane;
use crate::shell::ShellConnector;
use crate::tunnel::{ContainerTunnel, ReadinessPolicy};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub readiness: ReadinessPolicy,
    pub connect_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            readiness: ReadinessPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives one container from request to ready, or to a failure that says
/// where it broke and whether the container exists.
///
/// Holds only shared, immutable collaborators, so one orchestrator can serve
/// several concurrent `provision` calls; each call owns its own channel.
pub struct Orchestrator {
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn ShellConnector>,
    issuer: Arc<AuthKeyIssuer>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        connector: Arc<dyn ShellConnector>,
        issuer: Arc<AuthKeyIssuer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            control_plane,
            connector,
            issuer,
            settings,
        }
    }

    pub async fn provision(
        &self,
        spec: &ContainerSpec,
        inventory: &NodeInventory,
        budget: &OperationBudget,
    ) -> LifecycleOutcome {
        match self.create(spec, inventory, budget).await {
            Ok(created) => self.complete(created, budget).await,
            Err(outcome) => outcome,
        }
    }

    /// Provisions several containers. Ids are allocated and containers
    /// created one at a time, since the cluster only hands out an id once a
    /// container holds it; start, readiness and steps then run concurrently.
    /// Outcomes come back in input order.
    pub async fn provision_batch(
        &self,
        specs: &[ContainerSpec],
        inventory: &NodeInventory,
        budget: &OperationBudget,
    ) -> Vec<LifecycleOutcome> {
        let mut outcomes: Vec<Option<LifecycleOutcome>> = specs.iter().map(|_| None).collect();
        let mut created = Vec::with_capacity(specs.len());

        for (idx, spec) in specs.iter().enumerate() {
            match self.create(spec, inventory, budget).await {
                Ok(container) => created.push((idx, container)),
                Err(outcome) => outcomes[idx] = Some(outcome),
            }
        }

        let finished = join_all(
            created
                .into_iter()
                .map(|(idx, container)| async move { (idx, self.complete(container, budget).await) }),
        )
        .await;
        for (idx, outcome) in finished {
            outcomes[idx] = Some(outcome);
        }

        outcomes.into_iter().flatten().collect()
    }

    /// Selects a node, allocates an id and creates the container, leaving it
    /// stopped. Failures come back as finished outcomes.
    pub async fn create<'a>(
        &self,
        spec: &'a ContainerSpec,
        inventory: &NodeInventory,
        budget: &OperationBudget,
    ) -> std::result::Result<CreatedContainer<'a>, LifecycleOutcome> {
        let mut progress = Progress::new(spec);
        info!("Provisioning {} ({} step(s))", spec.hostname, spec.steps.len());

        let node = match budget
            .check("node selection")
            .and_then(|_| selector::select(spec, inventory))
        {
            Ok(node) => node,
            Err(e) => return Err(progress.fail(FailedStage::Selection, e)),
        };
        progress.node = Some(node.clone());
        progress.advance(ProvisionState::NodeSelected);

        if let Err(e) = budget.check("id allocation") {
            return Err(progress.fail(FailedStage::Allocation, e));
        }
        let vmid = match allocator::allocate(self.control_plane.as_ref(), spec.vmid).await {
            Ok(vmid) => vmid,
            Err(e) => return Err(progress.fail(FailedStage::Allocation, e)),
        };
        progress.vmid = Some(vmid);
        progress.advance(ProvisionState::IdCreated);

        if let Err(e) = budget.check("creation") {
            return Err(progress.fail(FailedStage::Creation, e));
        }
        if let Err(e) = self.control_plane.create_container(&node, vmid, spec).await {
            return Err(match e {
                Error::TaskPending { .. } => progress.fail(FailedStage::CreationPending, e),
                Error::CreationFailed(_) => progress.fail(FailedStage::Creation, e),
                other => progress.fail(FailedStage::Creation, Error::CreationFailed(other.to_string())),
            });
        }
        info!("Created CT {} ({}) on {}", vmid, spec.hostname, node);
        progress.advance(ProvisionState::Created);

        Ok(CreatedContainer { progress, node, vmid })
    }

    /// Starts a created container, waits for it and runs its steps.
    pub async fn complete(&self, created: CreatedContainer<'_>, budget: &OperationBudget) -> LifecycleOutcome {
        let CreatedContainer {
            mut progress,
            node,
            vmid,
        } = created;
        let spec = progress.spec;

        let mut tunnel = match self.bring_up(&node, vmid, spec, budget, &mut progress).await {
            Ok(tunnel) => tunnel,
            Err(e) => return progress.fail(FailedStage::Readiness, e),
        };
        progress.advance(ProvisionState::Provisioning);

        let result = self.run_steps(&mut tunnel, vmid, spec, budget, &mut progress).await;
        tunnel.close().await;

        match result {
            Ok(()) => progress.finish(),
            Err((stage, e)) => progress.fail(stage, e),
        }
    }

    /// Opens the node channel, prepares overlay access, starts the container
    /// and waits until it accepts commands.
    async fn bring_up(
        &self,
        node: &str,
        vmid: u32,
        spec: &ContainerSpec,
        budget: &OperationBudget,
        progress: &mut Progress<'_>,
    ) -> Result<ContainerTunnel> {
        budget.check("container start")?;
        let mut tunnel =
            ContainerTunnel::open(self.connector.clone(), node, self.settings.connect_timeout).await?;

        match self.start_and_wait(&mut tunnel, node, vmid, spec, budget, progress).await {
            Ok(()) => Ok(tunnel),
            Err(e) => {
                tunnel.close().await;
                Err(e)
            }
        }
    }

    async fn start_and_wait(
        &self,
        tunnel: &mut ContainerTunnel,
        node: &str,
        vmid: u32,
        spec: &ContainerSpec,
        budget: &OperationBudget,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let needs_overlay = spec.overlay.is_some() || spec.steps.iter().any(|s| s.overlay_join);
        if needs_overlay {
            tunnel.prepare_overlay_device(vmid).await?;
        }

        self.control_plane.start_container(node, vmid).await?;
        info!("Started CT {}", vmid);
        progress.advance(ProvisionState::WaitingReady);

        tunnel
            .wait_ready(vmid, &self.settings.readiness, budget)
            .await?;
        Ok(())
    }

    async fn run_steps(
        &self,
        tunnel: &mut ContainerTunnel,
        vmid: u32,
        spec: &ContainerSpec,
        budget: &OperationBudget,
        progress: &mut Progress<'_>,
    ) -> std::result::Result<(), (FailedStage, Error)> {
        let total = spec.steps.len();

        for (idx, step) in spec.steps.iter().enumerate() {
            let stage = FailedStage::Step(step.name.clone());
            budget
                .check(&format!("step '{}'", step.name))
                .map_err(|e| (stage.clone(), e))?;

            info!("[{}/{}] Running step '{}' in CT {}", idx + 1, total, step.name, vmid);
            let started = Instant::now();

            let result = match self.execute(tunnel, vmid, spec, step, budget).await {
                Ok(result) => result,
                Err(e) => {
                    progress.results.push(ExecutionResult::not_run(&step.name, &e, started.elapsed()));
                    if e.is_auth_rejected() || !step.continue_on_error {
                        return Err((stage, e));
                    }
                    warn!("Step '{}' could not run, continuing: {}", step.name, e);
                    continue;
                }
            };

            let timeout = budget.clip(step.timeout);
            let failure = result.to_error(timeout);
            debug!(
                "Step '{}' {} in {:.1}s",
                step.name,
                result.outcome,
                result.elapsed.as_secs_f64()
            );
            progress.results.push(result);

            if let Some(e) = failure {
                if !step.continue_on_error {
                    return Err((stage, e));
                }
                warn!("{}; continuing", e);
            }
        }

        Ok(())
    }

    async fn execute(
        &self,
        tunnel: &mut ContainerTunnel,
        vmid: u32,
        spec: &ContainerSpec,
        step: &ProvisioningStep,
        budget: &OperationBudget,
    ) -> Result<ExecutionResult> {
        let mut env = step.environment.clone();
        if step.overlay_join {
            let request = spec.overlay.clone().unwrap_or_default();
            let key = self
                .issuer
                .ensure_key(
                    request.auth_key.as_deref(),
                    &spec.hostname,
                    request.ephemeral,
                    &request.tags,
                )
                .await?;
            env.insert(AUTH_KEY_ENV.to_string(), key);
        }

        let (interpreter, script) = steps::invocation(step, &env);
        let timeout = budget.clip(step.timeout);
        let result = tunnel
            .exec(vmid, &step.name, &interpreter, &script, timeout)
            .await?;
        Ok(result.named(&step.name))
    }
}

/// A container that exists on the cluster but has not been started.
pub struct CreatedContainer<'a> {
    progress: Progress<'a>,
    node: String,
    vmid: u32,
}

impl CreatedContainer<'_> {
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn hostname(&self) -> &str {
        &self.progress.spec.hostname
    }
}

/// State of one `provision` call.
struct Progress<'a> {
    spec: &'a ContainerSpec,
    state: ProvisionState,
    trail: Vec<ProvisionState>,
    vmid: Option<u32>,
    node: Option<String>,
    results: Vec<ExecutionResult>,
}

impl<'a> Progress<'a> {
    fn new(spec: &'a ContainerSpec) -> Self {
        Self {
            spec,
            state: ProvisionState::Requested,
            trail: vec![ProvisionState::Requested],
            vmid: None,
            node: None,
            results: Vec::with_capacity(spec.steps.len()),
        }
    }

    fn advance(&mut self, next: ProvisionState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("{}: {:?} -> {:?}", self.spec.hostname, self.state, next);
        self.trail.push(next.clone());
        self.state = next;
    }

    /// Records steps that never ran.
    fn pad_skipped(&mut self) {
        let reached = self.results.len();
        for step in self.spec.steps.iter().skip(reached) {
            self.results.push(ExecutionResult::skipped(&step.name));
        }
    }

    fn location(&self) -> String {
        match (self.vmid, &self.node) {
            (Some(vmid), Some(node)) => format!("CT {vmid} on {node}"),
            (None, Some(node)) => format!("node {node}"),
            _ => "no node".to_string(),
        }
    }

    fn fail(mut self, stage: FailedStage, err: Error) -> LifecycleOutcome {
        self.advance(ProvisionState::Failed(stage.clone()));
        self.pad_skipped();

        let tag = stage.outcome_tag();
        let container_exists = stage.container_exists();
        let mut summary = format!("{}: {} at {}: {}", self.spec.hostname, tag, stage, err);
        match stage {
            FailedStage::CreationPending => {
                summary.push_str(&format!("; {} may still appear", self.location()))
            }
            _ if container_exists => {
                summary.push_str(&format!("; {} still exists", self.location()))
            }
            _ => {}
        }
        error!("{}", summary);

        LifecycleOutcome {
            tag,
            hostname: self.spec.hostname.clone(),
            vmid: self.vmid,
            node: self.node,
            results: self.results,
            trail: self.trail,
            failed_stage: Some(stage),
            error: Some(err),
            container_exists,
            summary,
        }
    }

    fn finish(mut self) -> LifecycleOutcome {
        self.advance(ProvisionState::Ready);

        let count = |o: StepOutcome| self.results.iter().filter(|r| r.outcome == o).count();
        let mut summary = format!(
            "{}: ready as {} ({} step(s) ok",
            self.spec.hostname,
            self.location(),
            count(StepOutcome::Ok)
        );
        let tolerated = count(StepOutcome::Failed) + count(StepOutcome::TimedOut);
        if tolerated > 0 {
            summary.push_str(&format!(", {tolerated} failed but tolerated"));
        }
        summary.push(')');
        info!("{}", summary);

        LifecycleOutcome {
            tag: OutcomeTag::Ready,
            hostname: self.spec.hostname.clone(),
            vmid: self.vmid,
            node: self.node,
            results: self.results,
            trail: self.trail,
            failed_stage: None,
            error: None,
            container_exists: true,
            summary,
        }
    }
}
