//! Tests for the provisioning state machine.
//!
//! Drives `Orchestrator::provision` against in-memory collaborators and checks
//! outcome tags, step results, state trails and the commands sent to nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pxrun::error::Error;
use pxrun::models::{
    FailedStage, OutcomeTag, OverlayRequest, ProvisionState, ProvisioningStep, StepOutcome,
};
use pxrun::overlay::{AuthKeyIssuer, OverlayDirectory};
use pxrun::provision::{Orchestrator, OrchestratorSettings};
use pxrun::tunnel::ReadinessPolicy;
use pxrun::OperationBudget;

fn orchestrator(
    control_plane: Arc<MockControlPlane>,
    connector: Arc<MockConnector>,
    overlay: Option<Arc<MockOverlay>>,
) -> Orchestrator {
    let management = overlay.map(|o| o as Arc<dyn OverlayDirectory>);
    Orchestrator::new(
        control_plane,
        connector,
        Arc::new(AuthKeyIssuer::new(management, None)),
        OrchestratorSettings::default(),
    )
}

fn three_steps(continue_on_error: bool) -> Vec<ProvisioningStep> {
    vec![
        ProvisioningStep::new("one", "echo one"),
        ProvisioningStep::new("two", "echo two").continue_on_error(continue_on_error),
        ProvisioningStep::new("three", "echo three"),
    ]
}

/// Step "two" exits 2, everything else succeeds.
fn step_two_fails() -> MockConnector {
    MockConnector::new(|cmd| {
        if cmd.command.contains("echo two") {
            Ok(exited(&cmd.label, 2))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    })
}

fn outcomes(results: &[pxrun::models::ExecutionResult]) -> Vec<StepOutcome> {
    results.iter().map(|r| r.outcome).collect()
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_all_steps_ok_reaches_ready() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::succeeding());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let spec = spec_with_steps("web1", three_steps(false));
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.tag, OutcomeTag::Ready);
    assert!(outcome.is_ready());
    assert_eq!(outcome.vmid, Some(101));
    assert_eq!(outcome.node.as_deref(), Some("pve1"));
    assert!(outcome.container_exists);
    assert!(outcome.error.is_none());
    assert_eq!(outcomes(&outcome.results), vec![StepOutcome::Ok; 3]);
    assert_eq!(
        outcome.trail,
        vec![
            ProvisionState::Requested,
            ProvisionState::NodeSelected,
            ProvisionState::IdCreated,
            ProvisionState::Created,
            ProvisionState::WaitingReady,
            ProvisionState::Provisioning,
            ProvisionState::Ready,
        ]
    );
    assert_eq!(cp.calls(), vec!["allocate_id None", "create pve1 101", "start pve1 101"]);
}

#[tokio::test]
async fn test_steps_run_in_input_order_inside_container() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::succeeding());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let spec = spec_with_steps("web1", three_steps(false));
    orch.provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    let commands = conn.commands();
    assert_eq!(commands.len(), 4, "readiness check plus three steps");
    assert_eq!(commands[0], "pct exec 101 -- sh -c true");
    assert!(commands[1].contains("echo one"));
    assert!(commands[2].contains("echo two"));
    assert!(commands[3].contains("echo three"));
    assert!(commands.iter().all(|c| c.starts_with("pct exec 101 -- ")));
    assert_eq!(conn.opened(), 1, "one channel for the whole run");
}

#[tokio::test]
async fn test_requested_vmid_is_passed_to_allocator() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let mut spec = spec("web1");
    spec.vmid = Some(250);
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.vmid, Some(250));
    assert_eq!(cp.calls()[0], "allocate_id Some(250)");
}

// =============================================================================
// Step Failure Policy
// =============================================================================

#[tokio::test]
async fn test_failed_step_without_continue_skips_the_rest() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(step_two_fails());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let spec = spec_with_steps("web1", three_steps(false));
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreatedButProvisioningFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::Step("two".to_string())));
    assert!(outcome.container_exists);
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::Ok, StepOutcome::Failed, StepOutcome::Skipped]
    );
    assert_eq!(outcome.results[2].name, "three");
    assert!(!conn.commands().iter().any(|c| c.contains("echo three")));

    match outcome.error {
        Some(Error::StepFailed { name, exit_code, stderr }) => {
            assert_eq!(name, "two");
            assert_eq!(exit_code, Some(2));
            assert!(stderr.contains("boom"));
        }
        other => panic!("expected StepFailed, got {other:?}"),
    }
    assert_eq!(
        outcome.trail.last(),
        Some(&ProvisionState::Failed(FailedStage::Step("two".to_string())))
    );
    assert!(outcome.summary.contains("still exists"));
}

#[tokio::test]
async fn test_failed_step_with_continue_still_reaches_ready() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(step_two_fails());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let spec = spec_with_steps("web1", three_steps(true));
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.tag, OutcomeTag::Ready);
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::Ok, StepOutcome::Failed, StepOutcome::Ok]
    );
    assert_eq!(outcome.count(StepOutcome::Failed), 1);
    assert!(conn.commands().iter().any(|c| c.contains("echo three")));
    assert!(outcome.summary.contains("tolerated"));
}

#[tokio::test]
async fn test_timed_out_step_reopens_channel_when_continuing() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::new(|cmd| {
        if cmd.command.contains("sleep 999") {
            Ok(timed_out(&cmd.label))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let steps = vec![
        ProvisioningStep::new("slow", "sleep 999")
            .with_timeout(Duration::from_secs(1))
            .continue_on_error(true),
        ProvisioningStep::new("after", "echo after"),
    ];
    let outcome = orch
        .provision(
            &spec_with_steps("web1", steps),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::Ready);
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::TimedOut, StepOutcome::Ok]
    );
    assert_eq!(conn.opened(), 2, "a timed-out channel is never reused");
}

#[tokio::test]
async fn test_timed_out_step_without_continue_fails_run() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::new(|cmd| {
        if cmd.label == "slow" {
            Ok(timed_out(&cmd.label))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = orchestrator(cp.clone(), conn, None);

    let steps = vec![
        ProvisioningStep::new("slow", "sleep 999").with_timeout(Duration::from_secs(7)),
        ProvisioningStep::new("after", "echo after"),
    ];
    let outcome = orch
        .provision(
            &spec_with_steps("web1", steps),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreatedButProvisioningFailed);
    assert!(matches!(
        outcome.error,
        Some(Error::StepTimedOut { ref name, timeout }) if name == "slow" && timeout == Duration::from_secs(7)
    ));
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::TimedOut, StepOutcome::Skipped]
    );
}

#[tokio::test]
async fn test_auth_rejected_aborts_even_with_continue() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::new(|cmd| {
        if cmd.label == "first" {
            Err(Error::AuthRejected {
                host: "pve1".to_string(),
                detail: "Permission denied (publickey)".to_string(),
            })
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = orchestrator(cp.clone(), conn, None);

    let steps = vec![
        ProvisioningStep::new("first", "echo first").continue_on_error(true),
        ProvisioningStep::new("second", "echo second"),
    ];
    let outcome = orch
        .provision(
            &spec_with_steps("web1", steps),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreatedButProvisioningFailed);
    assert!(outcome.error.as_ref().is_some_and(|e| e.is_auth_rejected()));
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::Failed, StepOutcome::Skipped]
    );
    assert!(outcome.results[0].stderr.contains("Permission denied"));
}

// =============================================================================
// Early Stage Failures
// =============================================================================

#[tokio::test]
async fn test_selection_failure_is_creation_failed() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let mut spec = spec_with_steps("web1", three_steps(false));
    spec.node = Some("pve9".to_string());
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreationFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::Selection));
    assert!(matches!(outcome.error, Some(Error::NodeUnavailable(_))));
    assert!(!outcome.container_exists);
    assert_eq!(outcome.vmid, None);
    assert_eq!(outcome.node, None);
    assert_eq!(outcomes(&outcome.results), vec![StepOutcome::Skipped; 3]);
    assert!(cp.calls().is_empty(), "nothing reaches the control plane");
}

#[tokio::test]
async fn test_allocation_failure_embeds_remote_error() {
    let mut mock = MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]);
    mock.fail_allocate = Some("VM 250 already exists".to_string());
    let cp = Arc::new(mock);
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreationFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::Allocation));
    match outcome.error {
        Some(Error::AllocationFailed(msg)) => assert!(msg.contains("already exists")),
        other => panic!("expected AllocationFailed, got {other:?}"),
    }
    assert_eq!(outcome.node.as_deref(), Some("pve1"));
}

#[tokio::test]
async fn test_create_failure_leaves_nothing_behind() {
    let mut mock = MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]);
    mock.fail_create = Some("storage 'local-lvm' is full".to_string());
    let cp = Arc::new(mock);
    let conn = Arc::new(MockConnector::succeeding());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let outcome = orch
        .provision(
            &spec_with_steps("web1", three_steps(false)),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreationFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::Creation));
    assert!(matches!(outcome.error, Some(Error::CreationFailed(ref m)) if m.contains("is full")));
    assert!(!outcome.container_exists);
    assert_eq!(outcome.vmid, Some(101));
    assert_eq!(conn.opened(), 0);
    assert!(!cp.calls().iter().any(|c| c.starts_with("delete")), "no rollback");
}

// =============================================================================
// Readiness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_reports_existing_container() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::new(|cmd| {
        if cmd.label == "readiness" {
            Ok(exited(&cmd.label, 255))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let outcome = orch
        .provision(
            &spec_with_steps("web1", three_steps(false)),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreatedButProvisioningFailed);
    assert_ne!(outcome.tag, OutcomeTag::CreationFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::Readiness));
    assert!(outcome.container_exists);
    match outcome.error {
        Some(Error::ContainerNotReady { vmid, attempts, waited, .. }) => {
            assert_eq!(vmid, 101);
            assert!(attempts > 1, "polled more than once");
            assert!(waited <= Duration::from_secs(60));
        }
        other => panic!("expected ContainerNotReady, got {other:?}"),
    }
    assert_eq!(outcomes(&outcome.results), vec![StepOutcome::Skipped; 3]);
    assert!(conn.commands().iter().all(|c| c.ends_with("sh -c true")));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_absorbs_startup_race() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    let conn = Arc::new(MockConnector::new(move |cmd| {
        if cmd.label == "readiness" {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(exited(&cmd.label, if n < 3 { 1 } else { 0 }))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = orchestrator(cp.clone(), conn, None);

    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert!(outcome.is_ready());
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_short_readiness_deadline_is_respected() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::new(|cmd| Ok(exited(&cmd.label, 1))));
    let orch = Orchestrator::new(
        cp.clone(),
        conn,
        Arc::new(AuthKeyIssuer::new(None, None)),
        OrchestratorSettings {
            readiness: ReadinessPolicy::default().with_deadline(Duration::from_secs(5)),
            ..Default::default()
        },
    );

    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    match outcome.error {
        Some(Error::ContainerNotReady { waited, .. }) => assert!(waited <= Duration::from_secs(5)),
        other => panic!("expected ContainerNotReady, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reopened_channel_stays_inside_readiness_deadline() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    let conn = Arc::new(MockConnector::new(move |cmd| {
        if cmd.label == "readiness" && counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            Ok(timed_out(&cmd.label))
        } else {
            Ok(exited(&cmd.label, 0))
        }
    }));
    let orch = Orchestrator::new(
        cp.clone(),
        conn.clone(),
        Arc::new(AuthKeyIssuer::new(None, None)),
        OrchestratorSettings {
            readiness: ReadinessPolicy::default().with_deadline(Duration::from_secs(3)),
            ..Default::default()
        },
    );

    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert!(outcome.is_ready());
    let timeouts = conn.connect_timeouts.lock().unwrap().clone();
    assert_eq!(timeouts.len(), 2);
    assert_eq!(timeouts[0], Duration::from_secs(10));
    assert!(timeouts[1] <= Duration::from_secs(3), "reopen got {:?}", timeouts[1]);
}

#[tokio::test]
async fn test_start_failure_is_readiness_failure() {
    let mut mock = MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]);
    mock.fail_start = Some("startup for container '101' failed".to_string());
    let cp = Arc::new(mock);
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.failed_stage, Some(FailedStage::Readiness));
    assert_eq!(outcome.tag, OutcomeTag::CreatedButProvisioningFailed);
    assert_eq!(
        outcome.trail.last(),
        Some(&ProvisionState::Failed(FailedStage::Readiness))
    );
}

// =============================================================================
// Overlay Join
// =============================================================================

#[tokio::test]
async fn test_overlay_step_receives_fresh_key() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::succeeding());
    let overlay = Arc::new(MockOverlay::default());
    let orch = orchestrator(cp.clone(), conn.clone(), Some(overlay.clone()));

    let mut spec = spec_with_steps(
        "web1",
        vec![ProvisioningStep::new("tailscale", "tailscale up --authkey=\"$TS_AUTHKEY\"").joins_overlay()],
    );
    spec.overlay = Some(OverlayRequest {
        auth_key: Some("tskey-auth-stale".to_string()),
        ephemeral: false,
        tags: vec!["tag:lxc".to_string()],
    });

    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;
    assert!(outcome.is_ready());
    assert_eq!(overlay.issued(), 1);

    let commands = conn.commands();
    assert!(
        commands[0].contains("/etc/pve/lxc/101.conf"),
        "TUN device granted before the container starts"
    );
    let step = commands.iter().find(|c| c.contains("tailscale up")).unwrap();
    assert!(step.contains("TS_AUTHKEY=tskey-auth-fresh1"));
    assert!(!step.contains("tskey-auth-stale"));

    let requests = overlay.key_requests.lock().unwrap();
    assert_eq!(requests[0].description, "pxrun web1");
    assert!(requests[0].persistent);
    assert_eq!(requests[0].tags, vec!["tag:lxc".to_string()]);
}

#[tokio::test]
async fn test_overlay_step_without_any_key_fails() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let conn = Arc::new(MockConnector::succeeding());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let spec = spec_with_steps(
        "web1",
        vec![
            ProvisioningStep::new("tailscale", "tailscale up").joins_overlay(),
            ProvisioningStep::new("after", "echo after"),
        ],
    );
    let outcome = orch
        .provision(&spec, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    assert_eq!(outcome.failed_stage, Some(FailedStage::Step("tailscale".to_string())));
    assert!(matches!(outcome.error, Some(Error::NoAuthKeyAvailable)));
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::Failed, StepOutcome::Skipped]
    );
    assert!(!conn.commands().iter().any(|c| c.contains("tailscale up")));
}

// =============================================================================
// Budget
// =============================================================================

#[tokio::test]
async fn test_cancelled_budget_stops_before_selection() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let budget = OperationBudget::unlimited();
    budget.cancel();
    let outcome = orch
        .provision(&spec("web1"), &inventory(cp.nodes.clone()), &budget)
        .await;

    assert_eq!(outcome.failed_stage, Some(FailedStage::Selection));
    assert!(matches!(outcome.error, Some(Error::Cancelled(_))));
    assert!(cp.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_between_steps_skips_remaining() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let budget = OperationBudget::unlimited();
    let flag = budget.cancel_flag();
    let conn = Arc::new(MockConnector::new(move |cmd| {
        if cmd.label == "one" {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(exited(&cmd.label, 0))
    }));
    let orch = orchestrator(cp.clone(), conn, None);

    let outcome = orch
        .provision(
            &spec_with_steps("web1", three_steps(false)),
            &inventory(cp.nodes.clone()),
            &budget,
        )
        .await;

    assert_eq!(outcome.failed_stage, Some(FailedStage::Step("two".to_string())));
    assert!(matches!(outcome.error, Some(Error::Cancelled(_))));
    assert_eq!(
        outcomes(&outcome.results),
        vec![StepOutcome::Ok, StepOutcome::Skipped, StepOutcome::Skipped]
    );
    assert!(outcome.container_exists);
}

// =============================================================================
// Unfinished Creation
// =============================================================================

#[tokio::test]
async fn test_unfinished_create_task_reports_possible_container() {
    let mut mock = MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]);
    mock.create_pending = true;
    let cp = Arc::new(mock);
    let conn = Arc::new(MockConnector::succeeding());
    let orch = orchestrator(cp.clone(), conn.clone(), None);

    let outcome = orch
        .provision(
            &spec_with_steps("web1", three_steps(false)),
            &inventory(cp.nodes.clone()),
            &OperationBudget::unlimited(),
        )
        .await;

    assert_eq!(outcome.tag, OutcomeTag::CreationFailed);
    assert_eq!(outcome.failed_stage, Some(FailedStage::CreationPending));
    assert!(matches!(outcome.error, Some(Error::TaskPending { .. })));
    assert!(outcome.container_exists);
    assert_eq!(outcome.vmid, Some(101));
    assert_eq!(outcome.node.as_deref(), Some("pve1"));
    assert!(outcome.summary.contains("CT 101 on pve1"));
    assert_eq!(conn.opened(), 0);
    assert_eq!(outcomes(&outcome.results), vec![StepOutcome::Skipped; 3]);
}

// =============================================================================
// Batch
// =============================================================================

#[tokio::test]
async fn test_batch_allocates_distinct_ids() {
    let mut mock = MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]);
    mock.lowest_free_id = true;
    let cp = Arc::new(mock);
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let specs = vec![spec("web1"), spec("web2"), spec("web3")];
    let outcomes = orch
        .provision_batch(&specs, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    let summary: Vec<(String, Option<u32>, OutcomeTag)> = outcomes
        .iter()
        .map(|o| (o.hostname.clone(), o.vmid, o.tag))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("web1".to_string(), Some(100), OutcomeTag::Ready),
            ("web2".to_string(), Some(101), OutcomeTag::Ready),
            ("web3".to_string(), Some(102), OutcomeTag::Ready),
        ]
    );
}

#[tokio::test]
async fn test_batch_keeps_input_order_around_failures() {
    let cp = Arc::new(MockControlPlane::new(vec![node("pve1", 0.1, 4, 32)]));
    let orch = orchestrator(cp.clone(), Arc::new(MockConnector::succeeding()), None);

    let mut unplaceable = spec("db1");
    unplaceable.node = Some("pve9".to_string());
    let specs = vec![spec("web1"), unplaceable, spec("web2")];
    let outcomes = orch
        .provision_batch(&specs, &inventory(cp.nodes.clone()), &OperationBudget::unlimited())
        .await;

    let hosts: Vec<&str> = outcomes.iter().map(|o| o.hostname.as_str()).collect();
    assert_eq!(hosts, ["web1", "db1", "web2"]);
    assert!(outcomes[0].is_ready());
    assert_eq!(outcomes[1].failed_stage, Some(FailedStage::Selection));
    assert!(outcomes[2].is_ready());
}
