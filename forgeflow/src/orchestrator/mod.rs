//! Workflow orchestration
//!
//! The [`Orchestrator`] validates a workflow, spawns one driver task per run
//! and hands back a [`WorkflowRun`] from which the caller reads lifecycle
//! events. Decisions (approve, reject, retry, cancel) go back through the
//! orchestrator, keyed by session id. A decision only lands if the run is
//! actually waiting for that kind of decision; nothing is ever queued.

mod driver;

use forgeflow_sdk::{WorkflowEvent, WorkflowState, WorkflowStatus};
use futures::Stream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::config::EngineConfig;
use crate::hooks::HookRegistry;
use crate::session::{generate_session_id, SessionError, SessionStore};
use crate::workflow::{WorkflowCatalog, WorkflowError};

use driver::RunDriver;

/// Capacity of the per-run event channel
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("workflow '{workflow}' uses agent '{agent_id}', which is not registered")]
    UnknownAgent { workflow: String, agent_id: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no resumable session found")]
    NoResumableSession,

    #[error("session {session_id} is {status} and cannot be resumed")]
    NotResumable {
        session_id: String,
        status: WorkflowStatus,
    },

    #[error("session {0} is already running in this process")]
    AlreadyRunning(String),

    #[error("session {0} is not running in this process")]
    NotLive(String),

    #[error("cannot {decision} session {session_id}: {reason}")]
    NoPendingDecision {
        session_id: String,
        decision: &'static str,
        reason: String,
    },

    #[error("workflow driver task failed: {0}")]
    Driver(String),
}

/// What happens after a recoverable error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Mark the run failed and end the stream
    #[default]
    FailFast,
    /// Suspend until the caller retries, rejects or cancels
    AwaitDecision,
    /// Retry agent failures automatically, rolling back between attempts
    AutoRetry { max_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub working_directory: PathBuf,
    pub recovery: RecoveryPolicy,
    pub verbose: bool,
    /// Use this id instead of generating one
    pub session_id: Option<String>,
}

impl RunOptions {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            recovery: RecoveryPolicy::default(),
            verbose: false,
            session_id: None,
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateKind {
    Approval,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    Approve,
    Reject(String),
    Retry,
    Cancel,
}

pub(crate) struct PendingGate {
    kind: GateKind,
    tx: oneshot::Sender<Decision>,
}

pub(crate) struct SessionControl {
    cancel: CancellationToken,
    gate: Option<PendingGate>,
}

pub(crate) type Controls = Arc<Mutex<HashMap<String, SessionControl>>>;

fn lock(controls: &Controls) -> MutexGuard<'_, HashMap<String, SessionControl>> {
    // A panicking holder cannot leave the map inconsistent
    controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one live run: a finite, single-consumer event stream
#[derive(Debug)]
pub struct WorkflowRun {
    session_id: String,
    events: mpsc::Receiver<WorkflowEvent>,
    task: JoinHandle<WorkflowState>,
}

impl WorkflowRun {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, `None` once the run has ended
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        self.events.recv().await
    }

    /// Drain the remaining events and return the final state.
    ///
    /// Blocks forever while the run is suspended at a gate nobody answers.
    pub async fn finish(mut self) -> Result<(Vec<WorkflowEvent>, WorkflowState), EngineError> {
        let mut remaining = Vec::new();
        while let Some(event) = self.events.recv().await {
            remaining.push(event);
        }
        let state = self
            .task
            .await
            .map_err(|e| EngineError::Driver(e.to_string()))?;
        Ok((remaining, state))
    }

    pub fn into_stream(self) -> impl Stream<Item = WorkflowEvent> {
        futures::stream::unfold(self.events, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}

/// Entry point for running and steering workflows
#[derive(Clone)]
pub struct Orchestrator {
    catalog: Arc<WorkflowCatalog>,
    agents: Arc<AgentRegistry>,
    hooks: Arc<HookRegistry>,
    config: Arc<EngineConfig>,
    controls: Controls,
}

impl Orchestrator {
    pub fn new(
        catalog: WorkflowCatalog,
        agents: AgentRegistry,
        hooks: HookRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            agents: Arc::new(agents),
            hooks: Arc::new(hooks),
            config: Arc::new(config),
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_store(&self, working_directory: &std::path::Path) -> SessionStore {
        SessionStore::new(self.config.sessions_dir(working_directory))
    }

    fn validate_agents(&self, workflow: &str) -> Result<(), EngineError> {
        let definition = self.catalog.get(workflow)?;
        for phase in &definition.phases {
            if !self.agents.contains(&phase.agent_id) {
                return Err(EngineError::UnknownAgent {
                    workflow: definition.name.clone(),
                    agent_id: phase.agent_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Start a new run of `workflow_name`
    pub async fn run_workflow(
        &self,
        workflow_name: &str,
        task_description: &str,
        options: RunOptions,
    ) -> Result<WorkflowRun, EngineError> {
        self.validate_agents(workflow_name)?;

        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(generate_session_id);
        let state = WorkflowState::new(
            session_id,
            workflow_name,
            task_description,
            options.working_directory.clone(),
        );

        info!(
            session_id = %state.session_id,
            workflow = workflow_name,
            "Starting workflow"
        );
        self.spawn(state, options, false)
    }

    /// Continue a persisted session. With `session_id` unset, picks the
    /// newest resumable session in the working directory.
    pub async fn resume_workflow(
        &self,
        session_id: Option<&str>,
        options: RunOptions,
    ) -> Result<WorkflowRun, EngineError> {
        let store = self.session_store(&options.working_directory);
        let stored = match session_id {
            Some(id) => store
                .load(id)
                .await?
                .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?,
            None => store
                .get_resumable()
                .await?
                .ok_or(EngineError::NoResumableSession)?,
        };

        let state = stored.state;
        if !state.status.is_resumable() {
            return Err(EngineError::NotResumable {
                session_id: state.session_id,
                status: state.status,
            });
        }
        self.validate_agents(&state.workflow_name)?;

        info!(
            session_id = %state.session_id,
            workflow = %state.workflow_name,
            phase_index = state.current_phase_index,
            "Resuming workflow"
        );
        self.spawn(state, options, true)
    }

    fn spawn(
        &self,
        state: WorkflowState,
        options: RunOptions,
        resumed: bool,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self.catalog.get(&state.workflow_name)?.clone();
        let session_id = state.session_id.clone();
        let cancel = CancellationToken::new();

        {
            let mut controls = lock(&self.controls);
            if controls.contains_key(&session_id) {
                return Err(EngineError::AlreadyRunning(session_id));
            }
            controls.insert(
                session_id.clone(),
                SessionControl {
                    cancel: cancel.clone(),
                    gate: None,
                },
            );
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let store = self.session_store(&options.working_directory);
        let driver = RunDriver::new(
            definition,
            state,
            self.agents.clone(),
            self.hooks.clone(),
            self.config.clone(),
            store,
            tx,
            self.controls.clone(),
            cancel,
            options,
            resumed,
        );

        let controls = self.controls.clone();
        let id = session_id.clone();
        let task = tokio::spawn(async move {
            let state = driver.run().await;
            lock(&controls).remove(&id);
            state
        });

        Ok(WorkflowRun {
            session_id,
            events: rx,
            task,
        })
    }

    fn decide(
        &self,
        session_id: &str,
        decision: Decision,
        accepted: &[GateKind],
    ) -> Result<(), EngineError> {
        let name = match decision {
            Decision::Approve => "approve",
            Decision::Reject(_) => "reject",
            Decision::Retry => "retry",
            Decision::Cancel => "cancel",
        };

        let mut controls = lock(&self.controls);
        let control = controls
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotLive(session_id.to_string()))?;

        let pending = match control.gate.take() {
            Some(gate) if accepted.contains(&gate.kind) => gate,
            other => {
                let reason = match &other {
                    Some(gate) => format!("the run is waiting for a {:?} decision", gate.kind)
                        .to_lowercase(),
                    None => "the run is not waiting for a decision".to_string(),
                };
                control.gate = other;
                warn!(session_id, decision = name, %reason, "Decision rejected");
                return Err(EngineError::NoPendingDecision {
                    session_id: session_id.to_string(),
                    decision: name,
                    reason,
                });
            }
        };

        pending
            .tx
            .send(decision)
            .map_err(|_| EngineError::NotLive(session_id.to_string()))
    }

    /// Resume a run suspended at an approval gate
    pub fn approve(&self, session_id: &str) -> Result<(), EngineError> {
        self.decide(session_id, Decision::Approve, &[GateKind::Approval])
    }

    /// Reject the pending phase (rolling it back) or give up after an error
    pub fn reject(&self, session_id: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        self.decide(
            session_id,
            Decision::Reject(reason.into()),
            &[GateKind::Approval, GateKind::Recovery],
        )
    }

    /// Re-run the phase that just failed
    pub fn retry(&self, session_id: &str) -> Result<(), EngineError> {
        self.decide(session_id, Decision::Retry, &[GateKind::Recovery])
    }

    /// Cancel at the next suspension point. No further events are emitted.
    pub fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        let controls = lock(&self.controls);
        let control = controls
            .get(session_id)
            .ok_or_else(|| EngineError::NotLive(session_id.to_string()))?;
        control.cancel.cancel();
        info!(session_id, "Cancellation requested");
        Ok(())
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        lock(&self.controls).contains_key(session_id)
    }

    /// True when the run is suspended waiting for approval
    pub fn awaiting_approval(&self, session_id: &str) -> bool {
        lock(&self.controls)
            .get(session_id)
            .and_then(|control| control.gate.as_ref())
            .map(|gate| gate.kind == GateKind::Approval)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.agents)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
