use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pxrun::config::{ContainerFile, Overrides, Settings};
use pxrun::models::{
    ContainerSpec, ExecutionResult, FailedStage, LifecycleOutcome, NodeInventory, StepOutcome,
};
use pxrun::overlay::{AuthKeyIssuer, OverlayDirectory, TailscaleClient};
use pxrun::provision::{selector, Orchestrator, OrchestratorSettings};
use pxrun::proxmox::{ControlPlane, ProxmoxClient};
use pxrun::shell::{ShellConnector, SshConnector};
use pxrun::tunnel::ReadinessPolicy;
use pxrun::OperationBudget;

/// Lines of step output shown for failed steps.
const OUTPUT_TAIL_LINES: usize = 20;

pub struct CreateArgs {
    pub configs: Vec<PathBuf>,
    pub overrides: Overrides,
    pub dry_run: bool,
    /// Leave containers stopped after creation. Provisioning needs a running
    /// container, so no step runs.
    pub no_start: bool,
    pub timeout: Option<u64>,
    pub verbose: bool,
}

pub async fn create(settings: &Settings, args: CreateArgs) -> Result<()> {
    if args.configs.len() > 1 && args.overrides.hostname.is_some() {
        bail!("--hostname can only be used with a single config file");
    }

    let specs = args
        .configs
        .iter()
        .map(|path| {
            ContainerFile::load(path)
                .map(|file| file.into_spec(&args.overrides))
                .with_context(|| format!("Failed to load {}", path.display()))
        })
        .collect::<Result<Vec<ContainerSpec>>>()?;

    let control_plane: Arc<dyn ControlPlane> = Arc::new(ProxmoxClient::new(settings.proxmox.clone())?);
    let inventory = NodeInventory::fetch(control_plane.as_ref())
        .await
        .context("Failed to read cluster nodes")?;

    if args.dry_run {
        for spec in &specs {
            print_plan(spec, &inventory);
        }
        println!("\nDry run mode - no container will be created");
        return Ok(());
    }

    let management: Option<Arc<dyn OverlayDirectory>> = match &settings.tailscale {
        Some(auth) => Some(Arc::new(TailscaleClient::new(auth.clone())?) as Arc<dyn OverlayDirectory>),
        None => None,
    };
    let issuer = Arc::new(AuthKeyIssuer::new(management, settings.tailscale_auth_key.clone()));
    let connector: Arc<dyn ShellConnector> = Arc::new(SshConnector::new(settings.ssh.clone()));
    let orchestrator = Orchestrator::new(
        control_plane,
        connector,
        issuer,
        OrchestratorSettings {
            readiness: ReadinessPolicy::default().with_deadline(settings.ready_timeout),
            ..Default::default()
        },
    );

    let budget = match args.timeout {
        Some(secs) => OperationBudget::with_timeout(Duration::from_secs(secs)),
        None => OperationBudget::unlimited(),
    };
    let flag = budget.cancel_flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!(
            "\nCancelling after the current step. A command already running inside the \
             container may keep running. Press Ctrl-C again to abort immediately."
        );
    })
    .context("Failed to install Ctrl-C handler")?;

    if args.no_start {
        return create_stopped(&orchestrator, &specs, &inventory, &budget).await;
    }

    for spec in &specs {
        println!("Creating {} ({} provisioning step(s))...", spec.hostname, spec.steps.len());
    }
    let outcomes = orchestrator.provision_batch(&specs, &inventory, &budget).await;

    for outcome in &outcomes {
        print_outcome(outcome, args.verbose);
    }

    let failed = outcomes.iter().filter(|o| !o.is_ready()).count();
    if failed > 0 {
        bail!("{} of {} container(s) did not become ready", failed, outcomes.len());
    }
    Ok(())
}

async fn create_stopped(
    orchestrator: &Orchestrator,
    specs: &[ContainerSpec],
    inventory: &NodeInventory,
    budget: &OperationBudget,
) -> Result<()> {
    let mut failed = 0;
    for spec in specs {
        if !spec.steps.is_empty() {
            println!(
                "Creating {} without starting it; {} provisioning step(s) will not run",
                spec.hostname,
                spec.steps.len()
            );
        } else {
            println!("Creating {} without starting it...", spec.hostname);
        }
        match orchestrator.create(spec, inventory, budget).await {
            Ok(created) => println!(
                "\n✓ {}: created as CT {} on {} (stopped)",
                created.hostname(),
                created.vmid(),
                created.node()
            ),
            Err(outcome) => {
                failed += 1;
                print_outcome(&outcome, false);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} container(s) could not be created", failed, specs.len());
    }
    Ok(())
}

fn print_plan(spec: &ContainerSpec, inventory: &NodeInventory) {
    println!("\nContainer configuration:");
    println!("  Hostname: {}", spec.hostname);
    match selector::select(spec, inventory) {
        Ok(node) => println!("  Node: {node}"),
        Err(e) => println!("  Node: unavailable ({e})"),
    }
    println!("  Template: {}", spec.template_volid());
    println!(
        "  Resources: {} cores, {} MB RAM, {} MB swap, {} GB disk on {}",
        spec.cores, spec.memory_mb, spec.swap_mb, spec.disk_gb, spec.storage_pool
    );
    println!("  Network: {}", spec.network.to_net0());
    if let Some(features) = spec.features.to_param() {
        println!("  Features: {features}");
    }
    for mount in &spec.mounts {
        println!("  Mount: {}", mount.to_param());
    }
    if spec.steps.is_empty() {
        println!("  Provisioning: none");
    } else {
        println!("  Provisioning:");
        for (i, step) in spec.steps.iter().enumerate() {
            let mut flags = Vec::new();
            if step.continue_on_error {
                flags.push("continue on error");
            }
            if step.overlay_join {
                flags.push("joins tailnet");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            println!(
                "    {}. {} ({}s timeout){}",
                i + 1,
                step.name,
                step.timeout.as_secs(),
                flags
            );
        }
    }
}

fn print_outcome(outcome: &LifecycleOutcome, verbose: bool) {
    let mark = if outcome.is_ready() { "✓" } else { "✗" };
    println!("\n{mark} {}", outcome.summary);

    if !outcome.results.is_empty() {
        println!("  {:<24} {:<10} {:>6} {:>9}", "STEP", "OUTCOME", "EXIT", "ELAPSED");
        for result in &outcome.results {
            println!(
                "  {:<24} {:<10} {:>6} {:>8.1}s",
                result.name,
                result.outcome.to_string(),
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                result.elapsed.as_secs_f64()
            );
        }
        for result in &outcome.results {
            let failed = matches!(result.outcome, StepOutcome::Failed | StepOutcome::TimedOut);
            if verbose || failed {
                print_output(result, !verbose);
            }
        }
    }

    let pending = outcome.failed_stage == Some(FailedStage::CreationPending);
    match (outcome.vmid, &outcome.node, outcome.container_exists) {
        (Some(vmid), Some(node), true) if outcome.is_ready() => {
            println!("  Connect: ssh root@{node} pct enter {vmid}");
        }
        (Some(vmid), Some(node), true) if pending => {
            println!("  Container {vmid} may still be created on {node}; check its task in Proxmox.");
            println!("  Destroy it with: pxrun destroy {vmid}");
        }
        (Some(vmid), Some(node), true) => {
            println!("  Container {vmid} still exists on {node}.");
            println!("  Destroy it with: pxrun destroy {vmid}");
        }
        _ => {}
    }
}

fn print_output(result: &ExecutionResult, tail_only: bool) {
    for (label, text) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        println!("  --- {} {} ---", result.name, label);
        let lines: Vec<&str> = text.lines().collect();
        let start = if tail_only {
            lines.len().saturating_sub(OUTPUT_TAIL_LINES)
        } else {
            0
        };
        for line in &lines[start..] {
            println!("  {line}");
        }
    }
}
