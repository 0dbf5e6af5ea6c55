//! Per-run driver task
//!
//! Owns the [`WorkflowState`] for the lifetime of a run and executes phases
//! one at a time. Every exit path leaves the state persisted and, unless the
//! run was cancelled, the event stream ended by a final event.

use forgeflow_sdk::{
    AgentRequest, AgentResponse, CostReporter, ErrorKind, PhaseInput, PhaseResult, PhaseSpec,
    WorkflowDefinition, WorkflowEvent, WorkflowState, WorkflowStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{lock, Controls, Decision, GateKind, PendingGate, RecoveryPolicy, RunOptions};
use crate::agent::AgentRegistry;
use crate::budget::{check_budget, check_spend};
use crate::checkpoint::{self, CheckpointOutcome};
use crate::config::EngineConfig;
use crate::context::compaction::merge_same_role;
use crate::context::ContextWindowManager;
use crate::hooks::{HookContext, HookRegistry};
use crate::session::SessionStore;

/// How a phase attempt ended
enum PhaseOutcome {
    Completed,
    Retry,
    /// The run is over; the final event (if any) has been sent
    Stop,
}

/// A recoverable failure inside a phase
struct PhaseFailure {
    kind: ErrorKind,
    message: String,
    /// Roll back before retrying
    rollback: bool,
}

pub(super) struct RunDriver {
    definition: WorkflowDefinition,
    state: WorkflowState,
    agents: Arc<AgentRegistry>,
    hooks: Arc<HookRegistry>,
    config: Arc<EngineConfig>,
    context: ContextWindowManager,
    store: SessionStore,
    events: mpsc::Sender<WorkflowEvent>,
    controls: Controls,
    cancel: CancellationToken,
    options: RunOptions,
    resumed: bool,
    /// Checkpoint tag taken before each phase of this run
    checkpoints: HashMap<usize, String>,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        definition: WorkflowDefinition,
        state: WorkflowState,
        agents: Arc<AgentRegistry>,
        hooks: Arc<HookRegistry>,
        config: Arc<EngineConfig>,
        store: SessionStore,
        events: mpsc::Sender<WorkflowEvent>,
        controls: Controls,
        cancel: CancellationToken,
        options: RunOptions,
        resumed: bool,
    ) -> Self {
        let context = ContextWindowManager::new(&config.context);
        Self {
            definition,
            state,
            agents,
            hooks,
            config,
            context,
            store,
            events,
            controls,
            cancel,
            options,
            resumed,
            checkpoints: HashMap::new(),
        }
    }

    fn session_id(&self) -> String {
        self.state.session_id.clone()
    }

    pub(super) async fn run(mut self) -> WorkflowState {
        self.emit(WorkflowEvent::WorkflowStarted {
            session_id: self.session_id(),
            workflow_name: self.definition.name.clone(),
            total_phases: self.definition.phases.len(),
            resumed: self.resumed,
        })
        .await;

        if !self.persist().await {
            return self.state;
        }

        // A session saved while suspended at an approval gate resumes at that gate
        if self.state.status == WorkflowStatus::AwaitingApproval {
            let Some(index) = self.state.current_phase_index.checked_sub(1) else {
                warn!(
                    session_id = %self.state.session_id,
                    "Awaiting approval before any phase ran"
                );
                self.transition(WorkflowStatus::Running);
                return self.drive_phases().await;
            };
            if !self.approval_gate(index).await {
                return self.state;
            }
        }

        self.drive_phases().await
    }

    async fn drive_phases(mut self) -> WorkflowState {
        let mut attempt: u32 = 0;

        while self.state.current_phase_index < self.definition.phases.len() {
            if self.cancel.is_cancelled() {
                self.cancel_run().await;
                return self.state;
            }

            let index = self.state.current_phase_index;
            match self.execute_phase(index, attempt).await {
                PhaseOutcome::Completed => attempt = 0,
                PhaseOutcome::Retry => {
                    attempt += 1;
                    continue;
                }
                PhaseOutcome::Stop => return self.state,
            }

            if self.definition.phases[index].requires_approval && !self.approval_gate(index).await
            {
                return self.state;
            }
        }

        self.complete_run().await;
        self.state
    }

    // ------------------------------------------------------------------------
    // One phase
    // ------------------------------------------------------------------------

    async fn execute_phase(&mut self, index: usize, attempt: u32) -> PhaseOutcome {
        let phase = self.definition.phases[index].clone();
        let session_id = self.session_id();

        info!(
            session_id = %session_id,
            phase_index = index,
            agent_id = %phase.agent_id,
            attempt,
            "Phase started"
        );
        self.emit(WorkflowEvent::PhaseStarted {
            session_id: session_id.clone(),
            phase_index: index,
            agent_id: phase.agent_id.clone(),
            display_name: phase.display_name.clone(),
        })
        .await;

        // 1. pre-phase hooks
        match self.run_hooks(&phase.pre_phase_hook_ids).await {
            Ok(()) => {}
            Err(None) => {
                self.cancel_run().await;
                return PhaseOutcome::Stop;
            }
            Err(Some(message)) => {
                let failure = PhaseFailure {
                    kind: ErrorKind::HookRejected,
                    message,
                    rollback: false,
                };
                return self.recover(index, attempt, failure).await;
            }
        }

        // 2. budget
        let budget = check_budget(&self.state, &self.config.budget);
        if !budget.within_budget {
            let message = format!(
                "Budget exhausted: ${:.4} of ${:.2} spent, {} turns used",
                self.state.total_cost_usd,
                self.config.budget.max_budget_usd(),
                self.state.total_turns
            );
            self.fatal(Some(index), ErrorKind::BudgetExceeded, message).await;
            return PhaseOutcome::Stop;
        }

        // 3. checkpoint
        if !self.checkpoint(index, &phase).await {
            return PhaseOutcome::Stop;
        }

        // 4. input from earlier phases
        let input = self.phase_input(index, &phase);

        // 5. agent call
        let Some(invoker) = self.agents.get(&phase.agent_id) else {
            let message = format!("Agent '{}' is not registered", phase.agent_id);
            self.fatal(Some(index), ErrorKind::AgentFailed, message).await;
            return PhaseOutcome::Stop;
        };
        let request = AgentRequest {
            agent_id: phase.agent_id.clone(),
            input,
            context_messages: self.context.prepare(&self.state.conversation),
            budget_remaining_usd: budget.remaining_usd,
            turns_remaining: budget.remaining_turns,
            working_directory: self.state.working_directory.clone(),
        };

        let base_cost = self.state.total_cost_usd;
        let base_turns = self.state.total_turns;
        let mut reported_cost = base_cost;
        let mut reported_turns: u32 = 0;
        let (reporter, mut progress) = CostReporter::channel();
        let invocation = invoker.invoke(request, reporter);
        tokio::pin!(invocation);

        let result = loop {
            tokio::select! {
                result = &mut invocation => break result,
                Some(update) = progress.recv() => {
                    reported_cost = reported_cost.max(base_cost + update.cost_usd.max(0.0));
                    reported_turns = reported_turns.max(update.turns_used);
                    self.emit(WorkflowEvent::CostUpdate {
                        session_id: session_id.clone(),
                        phase_index: index,
                        current_cost_usd: reported_cost,
                        turns_used: update.turns_used,
                    })
                    .await;

                    let spend = check_spend(
                        reported_cost,
                        base_turns.saturating_add(reported_turns),
                        &self.config.budget,
                    );
                    if !spend.within_budget {
                        // dropping `invocation` aborts the agent
                        self.state.record_spend(reported_cost - base_cost, reported_turns);
                        let message = format!(
                            "Budget exhausted during phase {}: ${:.4} of ${:.2} spent",
                            index,
                            reported_cost,
                            self.config.budget.max_budget_usd()
                        );
                        self.fatal(Some(index), ErrorKind::BudgetExceeded, message).await;
                        return PhaseOutcome::Stop;
                    }
                }
            }
        };

        // Progress still queued when the call returned
        while let Ok(update) = progress.try_recv() {
            reported_cost = reported_cost.max(base_cost + update.cost_usd.max(0.0));
            reported_turns = reported_turns.max(update.turns_used);
        }

        // Spend of a call that produced no phase result; never less than what was reported
        let (spent_usd, spent_turns) = match &result {
            Ok(response) => (
                response.cost_usd.max(reported_cost - base_cost),
                response.turns_used.max(reported_turns),
            ),
            Err(_) => (reported_cost - base_cost, reported_turns),
        };

        if self.cancel.is_cancelled() {
            self.state.record_spend(spent_usd, spent_turns);
            debug!(
                session_id = %session_id,
                phase_index = index,
                "Discarding result of cancelled run"
            );
            self.cancel_run().await;
            return PhaseOutcome::Stop;
        }

        let response = match result {
            Ok(response) if response.success => response,
            Ok(response) => {
                self.state.record_spend(spent_usd, spent_turns);
                let message = response
                    .error
                    .unwrap_or_else(|| format!("Agent '{}' reported failure", phase.agent_id));
                let failure = PhaseFailure {
                    kind: ErrorKind::AgentFailed,
                    message,
                    rollback: true,
                };
                return self.recover(index, attempt, failure).await;
            }
            Err(e) => {
                self.state.record_spend(spent_usd, spent_turns);
                let failure = PhaseFailure {
                    kind: ErrorKind::AgentFailed,
                    message: e.to_string(),
                    rollback: true,
                };
                return self.recover(index, attempt, failure).await;
            }
        };

        // 6. record, post-phase hooks, persist, report
        self.finish_phase(index, &phase, attempt, response, reported_cost)
            .await
    }

    async fn finish_phase(
        &mut self,
        index: usize,
        phase: &PhaseSpec,
        attempt: u32,
        response: AgentResponse,
        reported_cost: f64,
    ) -> PhaseOutcome {
        let result = PhaseResult {
            agent_id: phase.agent_id.clone(),
            success: true,
            output: response.output,
            files_created: response.files_created,
            files_modified: response.files_modified,
            commits: response.commits,
            cost_usd: response.cost_usd.max(0.0),
            turns_used: response.turns_used,
        };
        self.state.record_phase_result(result.clone());

        match self.run_hooks(&phase.post_phase_hook_ids).await {
            Ok(()) => {}
            Err(None) => {
                self.cancel_run().await;
                return PhaseOutcome::Stop;
            }
            Err(Some(message)) => {
                // The spend stays recorded; the result no longer counts as a success
                if let Some(stored) = self.state.phase_results.get_mut(&phase.agent_id) {
                    stored.success = false;
                }
                let failure = PhaseFailure {
                    kind: ErrorKind::HookRejected,
                    message,
                    rollback: true,
                };
                return self.recover(index, attempt, failure).await;
            }
        }

        let mut conversation = std::mem::take(&mut self.state.conversation);
        conversation.extend(response.transcript);
        self.state.conversation = self.context.prepare(&merge_same_role(conversation));
        self.state.current_phase_index = index + 1;

        if !self.persist().await {
            return PhaseOutcome::Stop;
        }

        self.emit(WorkflowEvent::CostUpdate {
            session_id: self.session_id(),
            phase_index: index,
            current_cost_usd: self.state.total_cost_usd.max(reported_cost),
            turns_used: result.turns_used,
        })
        .await;

        info!(
            session_id = %self.state.session_id,
            phase_index = index,
            cost_usd = result.cost_usd,
            turns = result.turns_used,
            "Phase completed"
        );
        self.emit(WorkflowEvent::PhaseCompleted {
            session_id: self.session_id(),
            phase_index: index,
            result,
        })
        .await;

        PhaseOutcome::Completed
    }

    /// `Err(Some(message))` on rejection, `Err(None)` when cancelled between hooks
    async fn run_hooks(&mut self, hook_ids: &[String]) -> Result<(), Option<String>> {
        for hook_id in hook_ids {
            if self.cancel.is_cancelled() {
                return Err(None);
            }
            let context = HookContext::from_state(&self.state, self.options.verbose);
            let result = self.hooks.execute(hook_id, &context).await;
            if !result.passed {
                let reason = result
                    .error
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(Some(format!("Hook '{}' rejected the phase: {}", hook_id, reason)));
            }
        }
        if self.cancel.is_cancelled() {
            return Err(None);
        }
        Ok(())
    }

    /// Returns false when the run must stop
    async fn checkpoint(&mut self, index: usize, phase: &PhaseSpec) -> bool {
        if !self.config.checkpoints.enabled {
            return true;
        }

        let reason = match checkpoint::create_checkpoint(
            &self.state.working_directory,
            &self.state.session_id,
            index,
            &phase.display_name,
        )
        .await
        {
            Ok(CheckpointOutcome::Created(record)) => {
                self.checkpoints.insert(index, record.tag_name);
                return true;
            }
            Ok(CheckpointOutcome::Skipped { reason }) => reason,
            Err(e) => e.to_string(),
        };

        if self.config.checkpoints.require_version_control {
            let message = format!("Checkpoint required but unavailable: {}", reason);
            self.fatal(Some(index), ErrorKind::CheckpointUnavailable, message)
                .await;
            return false;
        }

        warn!(
            session_id = %self.state.session_id,
            phase_index = index,
            %reason,
            "Proceeding without checkpoint"
        );
        true
    }

    fn phase_input(&self, index: usize, phase: &PhaseSpec) -> PhaseInput {
        let previous_outputs: BTreeMap<String, serde_json::Value> = self.definition.phases[..index]
            .iter()
            .filter_map(|earlier| {
                self.state
                    .phase_results
                    .get(&earlier.agent_id)
                    .filter(|result| result.success)
                    .map(|result| (earlier.agent_id.clone(), result.output.clone()))
            })
            .collect();

        PhaseInput {
            task_description: self.state.task_description.clone(),
            phase_index: index,
            agent_id: phase.agent_id.clone(),
            display_name: phase.display_name.clone(),
            previous_outputs,
        }
    }

    // ------------------------------------------------------------------------
    // Recovery and gates
    // ------------------------------------------------------------------------

    async fn recover(&mut self, index: usize, attempt: u32, failure: PhaseFailure) -> PhaseOutcome {
        warn!(
            session_id = %self.state.session_id,
            phase_index = index,
            kind = ?failure.kind,
            message = %failure.message,
            "Phase failed"
        );

        // The gate opens before the error is emitted so an immediate decision lands
        let gate = if self.options.recovery == RecoveryPolicy::AwaitDecision {
            if !self.persist().await {
                return PhaseOutcome::Stop;
            }
            Some(self.open_gate(GateKind::Recovery))
        } else {
            None
        };

        self.emit(WorkflowEvent::WorkflowError {
            session_id: self.session_id(),
            phase_index: Some(index),
            kind: failure.kind,
            message: failure.message.clone(),
            recoverable: true,
        })
        .await;

        let retry = match (self.options.recovery, gate) {
            (RecoveryPolicy::AutoRetry { max_attempts }, _) => {
                failure.kind == ErrorKind::AgentFailed && attempt < max_attempts
            }
            (_, Some(gate)) => match self.wait_gate(gate).await {
                Decision::Retry => true,
                Decision::Cancel => {
                    self.cancel_run().await;
                    return PhaseOutcome::Stop;
                }
                Decision::Reject(reason) => {
                    info!(
                        session_id = %self.state.session_id,
                        %reason,
                        "Run abandoned after error"
                    );
                    false
                }
                Decision::Approve => false,
            },
            _ => false,
        };

        if !retry {
            self.fail_run().await;
            return PhaseOutcome::Stop;
        }

        if failure.rollback {
            if let Some(tag) = self.checkpoints.get(&index).cloned() {
                if let Err(e) =
                    checkpoint::rollback_to_checkpoint(&self.state.working_directory, &tag).await
                {
                    let message = format!("Rollback to {} before retry failed: {}", tag, e);
                    self.fatal(Some(index), ErrorKind::RollbackFailed, message).await;
                    return PhaseOutcome::Stop;
                }
            }
        }

        info!(
            session_id = %self.state.session_id,
            phase_index = index,
            attempt = attempt + 1,
            "Retrying phase"
        );
        PhaseOutcome::Retry
    }

    /// Suspend after phase `index`. Returns true when the run continues.
    async fn approval_gate(&mut self, index: usize) -> bool {
        self.transition(WorkflowStatus::AwaitingApproval);
        if !self.persist().await {
            return false;
        }

        let decision = self.await_approval(index).await;
        match decision {
            Decision::Approve => {
                info!(session_id = %self.state.session_id, phase_index = index, "Phase approved");
                self.transition(WorkflowStatus::Running);
                self.persist().await
            }
            Decision::Reject(reason) => {
                self.reject_phase(index, reason).await;
                false
            }
            Decision::Retry | Decision::Cancel => {
                self.cancel_run().await;
                false
            }
        }
    }

    async fn reject_phase(&mut self, index: usize, reason: String) {
        let tag = match self.checkpoints.get(&index) {
            Some(tag) => Some(tag.clone()),
            None => self.persisted_checkpoint(index).await,
        };

        if let Some(tag) = tag {
            if let Err(e) =
                checkpoint::rollback_to_checkpoint(&self.state.working_directory, &tag).await
            {
                let message = format!(
                    "Phase {} rejected ({}) but rollback to {} failed: {}",
                    index, reason, tag, e
                );
                self.fatal(Some(index), ErrorKind::RollbackFailed, message).await;
                return;
            }
        } else {
            warn!(
                session_id = %self.state.session_id,
                phase_index = index,
                "No checkpoint to roll back to"
            );
        }

        let message = format!("Phase {} rejected: {}", index, reason);
        self.fatal(Some(index), ErrorKind::Rejected, message).await;
    }

    /// Checkpoint taken by an earlier process for a resumed session
    async fn persisted_checkpoint(&self, index: usize) -> Option<String> {
        let phase = self.definition.phases.get(index)?;
        let tag = checkpoint::tag_name(&self.state.session_id, index, &phase.display_name);
        let existing =
            checkpoint::list_checkpoints(&self.state.working_directory, &self.state.session_id)
                .await
                .ok()?;
        existing.contains(&tag).then_some(tag)
    }

    /// Register a pending decision for the caller API
    fn open_gate(&self, kind: GateKind) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        if let Some(control) = lock(&self.controls).get_mut(&self.state.session_id) {
            control.gate = Some(PendingGate { kind, tx });
        }
        rx
    }

    async fn wait_gate(&mut self, rx: oneshot::Receiver<Decision>) -> Decision {
        let decision = tokio::select! {
            decision = rx => decision.unwrap_or(Decision::Cancel),
            _ = self.cancel.cancelled() => Decision::Cancel,
        };

        if let Some(control) = lock(&self.controls).get_mut(&self.state.session_id) {
            control.gate = None;
        }
        debug!(session_id = %self.state.session_id, ?decision, "Decision received");
        decision
    }

    async fn await_approval(&mut self, index: usize) -> Decision {
        let gate = self.open_gate(GateKind::Approval);
        let agent_id = self
            .definition
            .phases
            .get(index)
            .map(|phase| phase.agent_id.clone())
            .unwrap_or_default();
        self.emit(WorkflowEvent::ApprovalRequired {
            session_id: self.session_id(),
            phase_index: index,
            agent_id,
        })
        .await;
        self.wait_gate(gate).await
    }

    // ------------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: WorkflowStatus) {
        if let Err(e) = self.state.transition_to(next) {
            warn!(session_id = %self.state.session_id, error = %e, "Ignored status transition");
        }
    }

    async fn complete_run(&mut self) {
        self.transition(WorkflowStatus::Completed);
        if !self.persist().await {
            return;
        }
        info!(
            session_id = %self.state.session_id,
            total_cost_usd = self.state.total_cost_usd,
            total_turns = self.state.total_turns,
            "Workflow completed"
        );
        self.emit(WorkflowEvent::WorkflowCompleted {
            session_id: self.session_id(),
            total_cost_usd: self.state.total_cost_usd,
            total_turns: self.state.total_turns,
        })
        .await;
    }

    /// Non-recoverable error: emit it, then mark the run failed
    async fn fatal(&mut self, phase_index: Option<usize>, kind: ErrorKind, message: String) {
        error!(
            session_id = %self.state.session_id,
            ?phase_index,
            ?kind,
            %message,
            "Workflow failed"
        );
        self.emit(WorkflowEvent::WorkflowError {
            session_id: self.session_id(),
            phase_index,
            kind,
            message,
            recoverable: false,
        })
        .await;
        self.fail_run().await;
    }

    async fn fail_run(&mut self) {
        self.transition(WorkflowStatus::Failed);
        self.persist_quietly().await;
    }

    async fn cancel_run(&mut self) {
        info!(session_id = %self.state.session_id, "Workflow cancelled");
        self.transition(WorkflowStatus::Cancelled);
        self.persist_quietly().await;
    }

    // ------------------------------------------------------------------------
    // Persistence and events
    // ------------------------------------------------------------------------

    /// Save a snapshot. On failure the run is failed and false returned.
    async fn persist(&mut self) -> bool {
        match self.store.save(&self.state).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    session_id = %self.state.session_id,
                    error = %e,
                    "Failed to persist session"
                );
                self.emit(WorkflowEvent::WorkflowError {
                    session_id: self.session_id(),
                    phase_index: None,
                    kind: ErrorKind::Persistence,
                    message: e.to_string(),
                    recoverable: false,
                })
                .await;
                self.transition(WorkflowStatus::Failed);
                false
            }
        }
    }

    async fn persist_quietly(&self) {
        if let Err(e) = self.store.save(&self.state).await {
            error!(session_id = %self.state.session_id, error = %e, "Failed to persist session");
        }
    }

    async fn emit(&self, event: WorkflowEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.state.session_id, "Event receiver dropped");
        }
    }
}
