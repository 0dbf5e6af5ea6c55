//! End-to-end orchestrator runs with scripted agents

use super::common::*;
use forgeflow::config::BudgetConfig;
use forgeflow::hooks::{HookContext, HookRegistry, PhaseHook, TddEnforcementHook};
use forgeflow::session::SessionStore;
use forgeflow::{EngineError, RecoveryPolicy, RunOptions};
use forgeflow_sdk::{
    async_trait, ErrorKind, HookResult, PhaseResult, PhaseSpec, WorkflowEvent, WorkflowState,
    WorkflowStatus,
};
use futures::StreamExt;
use std::sync::Arc;

fn three_phases() -> forgeflow_sdk::WorkflowDefinition {
    workflow(
        "three",
        vec![
            PhaseSpec::new("architect", "Design"),
            PhaseSpec::new("implementer", "Implementation"),
            PhaseSpec::new("reviewer", "Review"),
        ],
    )
}

fn gated() -> forgeflow_sdk::WorkflowDefinition {
    workflow(
        "gated",
        vec![
            PhaseSpec::new("architect", "Design").with_approval(),
            PhaseSpec::new("implementer", "Implementation"),
        ],
    )
}

fn error_of(event: &WorkflowEvent) -> (ErrorKind, bool, Option<usize>) {
    match event {
        WorkflowEvent::WorkflowError {
            kind,
            recoverable,
            phase_index,
            ..
        } => (*kind, *recoverable, *phase_index),
        other => panic!("expected workflow-error, got {:?}", other),
    }
}

struct Rejecting;

#[async_trait]
impl PhaseHook for Rejecting {
    fn name(&self) -> &str {
        "always-reject"
    }

    fn description(&self) -> &str {
        "Rejects every phase"
    }

    async fn execute(&self, _context: &HookContext) -> HookResult {
        HookResult::fail("not today")
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    let (events, state) = finish(run).await;

    let mut expected = vec!["workflow-started"];
    for _ in 0..3 {
        expected.extend(["phase-started", "cost-update", "phase-completed"]);
    }
    expected.push("workflow-completed");
    assert_eq!(names(&events), expected);
    assert!(events.iter().all(|event| event.session_id() == session_id));

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.current_phase_index, 3);
    assert_eq!(state.phase_results.len(), 3);
    assert!((state.total_cost_usd - 0.3).abs() < 1e-9);
    assert!(state.completed_at.is_some());

    let WorkflowEvent::WorkflowCompleted { total_turns, .. } = events.last().unwrap() else {
        panic!("expected workflow-completed");
    };
    assert_eq!(*total_turns, 3);

    let stored = engine
        .session_store(dir.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state.status, WorkflowStatus::Completed);
    assert!(!engine.is_live(&session_id));
}

#[tokio::test]
async fn test_outputs_and_conversation_flow_to_later_phases() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("architect", Step::ok(serde_json::json!({"modules": ["auth"]})));
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    finish(run).await;

    let calls = agent.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].input.previous_outputs.is_empty());
    assert!(calls[0].context_messages.is_empty());

    let implementer = &calls[1];
    assert_eq!(implementer.input.task_description, "Add login");
    assert_eq!(
        implementer.input.previous_outputs["architect"],
        serde_json::json!({"modules": ["auth"]})
    );
    assert_eq!(implementer.context_messages.len(), 2);
    assert!((implementer.budget_remaining_usd - 9.9).abs() < 1e-9);

    let reviewer = &calls[2];
    assert_eq!(reviewer.input.previous_outputs.len(), 2);
    assert!(forgeflow::context::compaction::alternates(&reviewer.context_messages));
}

#[tokio::test]
async fn test_persisted_conversation_is_compacted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.context.compaction.threshold_tokens = 1;
    config.context.compaction.preserve_turns = 1;
    let engine = orchestrator(
        vec![three_phases()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        config,
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    let (_, state) = finish(run).await;

    // Uncompacted, three phases leave six messages behind
    assert_eq!(state.conversation.len(), 4);
    assert!(state.conversation[0].text().contains("Context compacted"));
    assert_eq!(
        state.conversation.last().map(|message| message.text()),
        Some("reviewer finished".to_string())
    );

    let stored = engine
        .session_store(dir.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state.conversation, state.conversation);
}

#[tokio::test]
async fn test_event_stream_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![three_phases()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let events: Vec<WorkflowEvent> = run.into_stream().collect().await;

    assert_eq!(events.len(), 11);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_cost_updates_never_decrease() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        "architect",
        Step {
            progress: vec![(0.05, 1), (0.02, 1), (0.08, 2)],
            ..Step::default()
        },
    );
    agent.script(
        "implementer",
        Step {
            progress: vec![(0.3, 1)],
            cost_usd: 0.25,
            ..Step::default()
        },
    );
    let engine = orchestrator(vec![three_phases()], agent, HookRegistry::new(), test_config());

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let costs: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            WorkflowEvent::CostUpdate {
                current_cost_usd, ..
            } => Some(*current_cost_usd),
            _ => None,
        })
        .collect();
    // Progress still queued when an agent returns is superseded by the phase total
    assert!(costs.len() >= 3);
    assert!(costs.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", costs);
    assert_eq!(state.status, WorkflowStatus::Completed);
}

// ============================================================================
// Approval gates
// ============================================================================

#[tokio::test]
async fn test_approval_gate_suspends_until_approved() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let engine = orchestrator(vec![gated()], agent.clone(), HookRegistry::new(), test_config());

    let mut run = engine
        .run_workflow("gated", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();

    let events = until_suspended(&mut run).await;
    assert_eq!(
        names(&events),
        vec![
            "workflow-started",
            "phase-started",
            "cost-update",
            "phase-completed",
            "approval-required"
        ]
    );
    assert!(engine.awaiting_approval(&session_id));
    assert_eq!(agent.calls_for("implementer"), 0);

    let stored = engine
        .session_store(dir.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state.status, WorkflowStatus::AwaitingApproval);
    assert_eq!(stored.state.current_phase_index, 1);

    engine.approve(&session_id).unwrap();
    let (rest, state) = finish(run).await;
    assert_eq!(names(&rest).last(), Some(&"workflow-completed"));
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(agent.calls_for("implementer"), 1);
}

#[tokio::test]
async fn test_reject_rolls_back_phase_work() {
    let repo = init_repo();
    let agent = ScriptedAgent::new();
    agent.script(
        "architect",
        Step {
            writes: Some(("design.md".to_string(), "draft".to_string())),
            ..Step::default()
        },
    );
    let mut config = test_config();
    config.checkpoints.enabled = true;
    let engine = orchestrator(vec![gated()], agent.clone(), HookRegistry::new(), config);

    let mut run = engine
        .run_workflow("gated", "Add login", RunOptions::new(repo.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    until_suspended(&mut run).await;
    assert!(repo.path().join("design.md").exists());

    engine.reject(&session_id, "wrong approach").unwrap();
    let (rest, state) = finish(run).await;

    assert_eq!(rest.len(), 1);
    let (kind, recoverable, phase_index) = error_of(&rest[0]);
    assert_eq!(kind, ErrorKind::Rejected);
    assert!(!recoverable);
    assert_eq!(phase_index, Some(0));

    assert!(!repo.path().join("design.md").exists());
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(agent.calls_for("implementer"), 0);

    let tags = git(repo.path(), &["tag", "-l"]);
    assert_eq!(tags, format!("ff-checkpoint/{}/pre-0-design", session_id));
    let stored = engine
        .session_store(repo.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_decisions_must_match_pending_gate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![gated()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );

    let mut run = engine
        .run_workflow("gated", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    until_suspended(&mut run).await;

    assert!(matches!(
        engine.retry(&session_id),
        Err(EngineError::NoPendingDecision { .. })
    ));
    // The gate is still open after a mismatched decision
    assert!(engine.awaiting_approval(&session_id));
    engine.approve(&session_id).unwrap();
    finish(run).await;

    assert!(matches!(
        engine.approve(&session_id),
        Err(EngineError::NotLive(_))
    ));
    assert!(matches!(
        engine.approve("no-such-session"),
        Err(EngineError::NotLive(_))
    ));
}

#[tokio::test]
async fn test_cancel_at_gate_ends_stream_silently() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![gated()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );

    let mut run = engine
        .run_workflow("gated", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    until_suspended(&mut run).await;

    engine.cancel(&session_id).unwrap();
    let (rest, state) = finish(run).await;

    assert!(rest.is_empty());
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    let stored = engine
        .session_store(dir.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state.status, WorkflowStatus::Cancelled);
}

// ============================================================================
// Budget
// ============================================================================

#[tokio::test]
async fn test_budget_exhausted_before_phase() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let mut config = test_config();
    config.budget = BudgetConfig::new(0.15, 10).unwrap();
    let engine = orchestrator(vec![three_phases()], agent.clone(), HookRegistry::new(), config);

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let (kind, recoverable, phase_index) = error_of(events.last().unwrap());
    assert_eq!(kind, ErrorKind::BudgetExceeded);
    assert!(!recoverable);
    assert_eq!(phase_index, Some(2));
    assert_eq!(agent.calls_for("reviewer"), 0);
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.current_phase_index, 2);
}

#[tokio::test]
async fn test_budget_exhausted_mid_phase_aborts_agent() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        "architect",
        Step {
            progress: vec![(0.4, 1), (1.2, 4)],
            hang: true,
            ..Step::default()
        },
    );
    let mut config = test_config();
    config.budget = BudgetConfig::new(1.0, 10).unwrap();
    let engine = orchestrator(vec![three_phases()], agent, HookRegistry::new(), config);

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    assert_eq!(
        names(&events),
        vec![
            "workflow-started",
            "phase-started",
            "cost-update",
            "cost-update",
            "workflow-error"
        ]
    );
    let (kind, recoverable, _) = error_of(&events[4]);
    assert_eq!(kind, ErrorKind::BudgetExceeded);
    assert!(!recoverable);
    assert!((state.total_cost_usd - 1.2).abs() < 1e-9);
    assert_eq!(state.total_turns, 4);
    assert!(state.phase_results.is_empty());
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_fail_fast_stops_after_agent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("implementer", Step::failing("compiler exploded"));
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let last = events.last().unwrap();
    let (kind, recoverable, phase_index) = error_of(last);
    assert_eq!(kind, ErrorKind::AgentFailed);
    assert!(recoverable);
    assert_eq!(phase_index, Some(1));
    let WorkflowEvent::WorkflowError { message, .. } = last else {
        panic!("expected workflow-error");
    };
    assert!(message.contains("compiler exploded"));

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(agent.calls_for("reviewer"), 0);
    // The failed attempt is still paid for
    assert!((state.total_cost_usd - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_await_decision_retry_reruns_phase() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("implementer", Step::failing("flaky network"));
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let options = RunOptions::new(dir.path()).with_recovery(RecoveryPolicy::AwaitDecision);
    let mut run = engine.run_workflow("three", "Add login", options).await.unwrap();
    let session_id = run.session_id().to_string();

    let events = until_suspended(&mut run).await;
    let (kind, recoverable, _) = error_of(events.last().unwrap());
    assert_eq!(kind, ErrorKind::AgentFailed);
    assert!(recoverable);
    assert!(matches!(
        engine.approve(&session_id),
        Err(EngineError::NoPendingDecision { .. })
    ));

    engine.retry(&session_id).unwrap();
    let (rest, state) = finish(run).await;

    assert_eq!(names(&rest)[0], "phase-started");
    assert_eq!(names(&rest).last(), Some(&"workflow-completed"));
    assert_eq!(agent.calls_for("implementer"), 2);
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_await_decision_reject_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("architect", Step::failing("bad prompt"));
    let engine = orchestrator(vec![three_phases()], agent, HookRegistry::new(), test_config());

    let options = RunOptions::new(dir.path()).with_recovery(RecoveryPolicy::AwaitDecision);
    let mut run = engine.run_workflow("three", "Add login", options).await.unwrap();
    let session_id = run.session_id().to_string();
    until_suspended(&mut run).await;

    engine.reject(&session_id, "give up").unwrap();
    let (rest, state) = finish(run).await;
    assert!(rest.is_empty());
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_auto_retry_recovers_agent_failures() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("architect", Step::failing("timeout"));
    agent.script("architect", Step::failing("timeout"));
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let options =
        RunOptions::new(dir.path()).with_recovery(RecoveryPolicy::AutoRetry { max_attempts: 2 });
    let run = engine.run_workflow("three", "Add login", options).await.unwrap();
    let (events, state) = finish(run).await;

    assert_eq!(agent.calls_for("architect"), 3);
    let errors = names(&events)
        .into_iter()
        .filter(|name| *name == "workflow-error")
        .count();
    assert_eq!(errors, 2);
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_spend_reported_before_agent_error_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script(
        "architect",
        Step {
            progress: vec![(0.5, 1)],
            transport_error: Some("connection reset".to_string()),
            ..Step::default()
        },
    );
    agent.script(
        "architect",
        Step {
            progress: vec![(0.1, 1)],
            cost_usd: 0.1,
            ..Step::default()
        },
    );
    let definition = workflow("single", vec![PhaseSpec::new("architect", "Design")]);
    let engine = orchestrator(vec![definition], agent.clone(), HookRegistry::new(), test_config());

    let options =
        RunOptions::new(dir.path()).with_recovery(RecoveryPolicy::AutoRetry { max_attempts: 2 });
    let run = engine.run_workflow("single", "Add login", options).await.unwrap();
    let (events, state) = finish(run).await;

    let costs: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            WorkflowEvent::CostUpdate {
                current_cost_usd, ..
            } => Some(*current_cost_usd),
            _ => None,
        })
        .collect();
    assert_eq!(agent.calls_for("architect"), 2);
    assert!(costs.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", costs);
    assert!((state.total_cost_usd - 0.6).abs() < 1e-9, "{}", state.total_cost_usd);
    assert_eq!(state.total_turns, 2);
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_auto_retry_gives_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    for _ in 0..3 {
        agent.script("architect", Step::failing("timeout"));
    }
    let engine = orchestrator(
        vec![three_phases()],
        agent.clone(),
        HookRegistry::new(),
        test_config(),
    );

    let options =
        RunOptions::new(dir.path()).with_recovery(RecoveryPolicy::AutoRetry { max_attempts: 2 });
    let run = engine.run_workflow("three", "Add login", options).await.unwrap();
    let (_, state) = finish(run).await;

    assert_eq!(agent.calls_for("architect"), 3);
    assert_eq!(state.status, WorkflowStatus::Failed);
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_pre_hook_rejection_skips_agent() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let definition = workflow(
        "hooked",
        vec![PhaseSpec::new("architect", "Design").with_pre_hook("always-reject")],
    );
    let hooks = HookRegistry::new().with_hook(Arc::new(Rejecting));
    let engine = orchestrator(vec![definition], agent.clone(), hooks, test_config());

    let run = engine
        .run_workflow("hooked", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let (kind, _, _) = error_of(events.last().unwrap());
    assert_eq!(kind, ErrorKind::HookRejected);
    assert_eq!(agent.calls_for("architect"), 0);
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_post_hook_rejection_replaces_completion() {
    let dir = tempfile::tempdir().unwrap();
    let definition = workflow(
        "reviewed",
        vec![PhaseSpec::new("architect", "Design").with_post_hook("always-reject")],
    );
    let hooks = HookRegistry::new().with_hook(Arc::new(Rejecting));
    let engine = orchestrator(vec![definition], ScriptedAgent::new(), hooks, test_config());

    let run = engine
        .run_workflow("reviewed", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    let (events, state) = finish(run).await;

    assert_eq!(
        names(&events),
        vec!["workflow-started", "phase-started", "workflow-error"]
    );

    let stored = engine
        .session_store(dir.path())
        .load(&session_id)
        .await
        .unwrap()
        .unwrap();
    for state in [&state, &stored.state] {
        let result = &state.phase_results["architect"];
        assert!(!result.success);
        assert!((state.total_cost_usd - 0.1).abs() < 1e-9);
        assert_eq!(state.status, WorkflowStatus::Failed);
    }
}

#[tokio::test]
async fn test_tdd_hook_blocks_implementation_without_failing_tests() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    agent.script("test-generator", Step::ok(serde_json::json!({"tests_generated": 4})));
    let definition = workflow(
        "bugfix",
        vec![
            PhaseSpec::new("test-generator", "Tests"),
            PhaseSpec::new("implementer", "Fix").with_pre_hook("tdd-enforcement"),
        ],
    );
    let runner = Arc::new(FixedTestRunner { passed: 4, failed: 0 });
    let hooks =
        HookRegistry::new().with_hook(Arc::new(TddEnforcementHook::new("test-generator", runner)));
    let engine = orchestrator(vec![definition], agent.clone(), hooks, test_config());

    let run = engine
        .run_workflow("bugfix", "Fix crash", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let WorkflowEvent::WorkflowError { kind, message, .. } = events.last().unwrap() else {
        panic!("expected workflow-error");
    };
    assert_eq!(*kind, ErrorKind::HookRejected);
    assert!(message.contains("TDD VIOLATION"));
    assert_eq!(agent.calls_for("implementer"), 0);
    assert_eq!(state.current_phase_index, 1);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[tokio::test]
async fn test_checkpoint_per_phase_in_git_repo() {
    let repo = init_repo();
    let mut config = test_config();
    config.checkpoints.enabled = true;
    let engine = orchestrator(
        vec![three_phases()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        config,
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(repo.path()))
        .await
        .unwrap();
    let session_id = run.session_id().to_string();
    let (_, state) = finish(run).await;
    assert_eq!(state.status, WorkflowStatus::Completed);

    let tags = forgeflow::checkpoint::list_checkpoints(repo.path(), &session_id)
        .await
        .unwrap();
    assert_eq!(tags.len(), 3);
    assert!(tags[2].ends_with("/pre-2-review"));
}

#[tokio::test]
async fn test_required_checkpoint_outside_git_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let mut config = test_config();
    config.checkpoints.enabled = true;
    config.checkpoints.require_version_control = true;
    let engine = orchestrator(vec![three_phases()], agent.clone(), HookRegistry::new(), config);

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (events, state) = finish(run).await;

    let (kind, recoverable, _) = error_of(events.last().unwrap());
    assert_eq!(kind, ErrorKind::CheckpointUnavailable);
    assert!(!recoverable);
    assert_eq!(agent.calls().len(), 0);
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_missing_checkpoint_outside_git_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.checkpoints.enabled = true;
    let engine = orchestrator(
        vec![three_phases()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        config,
    );

    let run = engine
        .run_workflow("three", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap();
    let (_, state) = finish(run).await;
    assert_eq!(state.status, WorkflowStatus::Completed);
}

// ============================================================================
// Resume and configuration errors
// ============================================================================

fn awaiting_after_design(session_id: &str, dir: &std::path::Path) -> WorkflowState {
    let mut state = WorkflowState::new(session_id, "gated", "Add login", dir);
    state.record_phase_result(PhaseResult {
        agent_id: "architect".to_string(),
        success: true,
        output: serde_json::json!({"modules": ["auth"]}),
        files_created: vec![],
        files_modified: vec![],
        commits: vec![],
        cost_usd: 0.5,
        turns_used: 2,
    });
    state.current_phase_index = 1;
    state.status = WorkflowStatus::AwaitingApproval;
    state
}

#[tokio::test]
async fn test_resume_from_approval_gate() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::new();
    let engine = orchestrator(vec![gated()], agent.clone(), HookRegistry::new(), test_config());
    engine
        .session_store(dir.path())
        .save(&awaiting_after_design("s-resume", dir.path()))
        .await
        .unwrap();

    let mut run = engine
        .resume_workflow(None, RunOptions::new(dir.path()))
        .await
        .unwrap();
    assert_eq!(run.session_id(), "s-resume");

    let events = until_suspended(&mut run).await;
    assert!(matches!(
        events[0],
        WorkflowEvent::WorkflowStarted { resumed: true, .. }
    ));
    assert!(matches!(
        events[1],
        WorkflowEvent::ApprovalRequired { phase_index: 0, .. }
    ));

    engine.approve("s-resume").unwrap();
    let (_, state) = finish(run).await;

    assert_eq!(agent.calls_for("architect"), 0);
    assert_eq!(agent.calls_for("implementer"), 1);
    assert_eq!(
        agent.calls()[0].input.previous_outputs["architect"],
        serde_json::json!({"modules": ["auth"]})
    );
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!((state.total_cost_usd - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_resume_rejects_finished_and_missing_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![gated()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );
    let store: SessionStore = engine.session_store(dir.path());

    assert!(matches!(
        engine.resume_workflow(None, RunOptions::new(dir.path())).await,
        Err(EngineError::NoResumableSession)
    ));
    assert!(matches!(
        engine
            .resume_workflow(Some("ghost"), RunOptions::new(dir.path()))
            .await,
        Err(EngineError::SessionNotFound(_))
    ));

    let mut done = awaiting_after_design("s-done", dir.path());
    done.status = WorkflowStatus::Completed;
    store.save(&done).await.unwrap();
    assert!(matches!(
        engine
            .resume_workflow(Some("s-done"), RunOptions::new(dir.path()))
            .await,
        Err(EngineError::NotResumable { .. })
    ));
}

#[tokio::test]
async fn test_unknown_workflow_and_agent_are_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![three_phases()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );

    assert!(matches!(
        engine
            .run_workflow("nope", "Add login", RunOptions::new(dir.path()))
            .await,
        Err(EngineError::Workflow(_))
    ));

    // A catalog entry whose agent was never registered
    let mut catalog = forgeflow::workflow::WorkflowCatalog::new();
    catalog
        .insert(workflow("ghostly", vec![PhaseSpec::new("ghost", "Haunt")]))
        .unwrap();
    let engine = forgeflow::Orchestrator::new(
        catalog,
        forgeflow::agent::AgentRegistry::new(),
        HookRegistry::new(),
        test_config(),
    );
    let err = engine
        .run_workflow("ghostly", "Add login", RunOptions::new(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownAgent { ref agent_id, .. } if agent_id == "ghost"));
}

#[tokio::test]
async fn test_same_session_cannot_run_twice() {
    let dir = tempfile::tempdir().unwrap();
    let engine = orchestrator(
        vec![gated()],
        ScriptedAgent::new(),
        HookRegistry::new(),
        test_config(),
    );

    let options = RunOptions::new(dir.path()).with_session_id("fixed-id");
    let mut run = engine
        .run_workflow("gated", "Add login", options.clone())
        .await
        .unwrap();
    until_suspended(&mut run).await;

    assert!(matches!(
        engine.run_workflow("gated", "Add login", options).await,
        Err(EngineError::AlreadyRunning(_))
    ));

    engine.cancel("fixed-id").unwrap();
    finish(run).await;
}
