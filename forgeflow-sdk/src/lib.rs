//! Shared types for forgeflow workflows.
//!
//! This crate holds everything that both the engine and the things it talks to
//! need to agree on: workflow definitions, the mutable run record, phase
//! results, hook results, lifecycle events and the agent collaborator contract.
//! It contains no engine logic.

pub mod agent;
pub mod conversation;

pub use agent::{
    AgentError, AgentInvoker, AgentRequest, AgentResponse, CostProgress, CostReporter, PhaseInput,
};
pub use conversation::{ContentBlock, Message, Role};

// Re-export async trait for convenience
pub use async_trait::async_trait;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Workflow Definitions
// ============================================================================

/// One scheduled unit of work delegated to an agent role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub agent_id: String,
    pub display_name: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, alias = "pre_phase_hooks")]
    pub pre_phase_hook_ids: Vec<String>,
    #[serde(default, alias = "post_phase_hooks")]
    pub post_phase_hook_ids: Vec<String>,
}

impl PhaseSpec {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            requires_approval: false,
            pre_phase_hook_ids: Vec::new(),
            post_phase_hook_ids: Vec::new(),
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_pre_hook(mut self, hook_id: impl Into<String>) -> Self {
        self.pre_phase_hook_ids.push(hook_id.into());
        self
    }

    pub fn with_post_hook(mut self, hook_id: impl Into<String>) -> Self {
        self.post_phase_hook_ids.push(hook_id.into());
        self
    }
}

/// Ordered, immutable list of phases making up a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
}

// ============================================================================
// Run State
// ============================================================================

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never change again once reached
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Sessions in these statuses can be picked up by `resume`
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::AwaitingApproval)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected attempt to move a run out of a terminal status
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("workflow is already {current}; cannot transition to {requested}")]
pub struct StatusTransitionError {
    pub current: WorkflowStatus,
    pub requested: WorkflowStatus,
}

/// Outcome of one phase execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub agent_id: String,
    pub success: bool,
    /// Agent-specific structured output, forwarded to later phases untouched
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub files_created: Vec<PathBuf>,
    #[serde(default)]
    pub files_modified: Vec<PathBuf>,
    #[serde(default)]
    pub commits: Vec<String>,
    pub cost_usd: f64,
    pub turns_used: u32,
}

/// The mutable run record, owned by the orchestrator while a run is live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_name: String,
    pub task_description: String,
    pub working_directory: PathBuf,
    pub current_phase_index: usize,
    pub status: WorkflowStatus,
    /// Latest result per agent; re-running a phase replaces the entry
    #[serde(default)]
    pub phase_results: BTreeMap<String, PhaseResult>,
    pub total_cost_usd: f64,
    pub total_turns: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Conversation shared across phases. Tool results are truncated and the
    /// history is compacted after each phase once it crosses the threshold.
    #[serde(default)]
    pub conversation: Vec<Message>,
}

impl WorkflowState {
    pub fn new(
        session_id: impl Into<String>,
        workflow_name: impl Into<String>,
        task_description: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workflow_name: workflow_name.into(),
            task_description: task_description.into(),
            working_directory: working_directory.into(),
            current_phase_index: 0,
            status: WorkflowStatus::Running,
            phase_results: BTreeMap::new(),
            total_cost_usd: 0.0,
            total_turns: 0,
            started_at: Utc::now(),
            completed_at: None,
            conversation: Vec::new(),
        }
    }

    /// Move to `next`, refusing to leave a terminal status.
    ///
    /// Entering a terminal status stamps `completed_at`.
    pub fn transition_to(&mut self, next: WorkflowStatus) -> Result<(), StatusTransitionError> {
        if self.status.is_terminal() {
            return Err(StatusTransitionError {
                current: self.status,
                requested: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Store a phase result and add its spend to the running totals
    pub fn record_phase_result(&mut self, result: PhaseResult) {
        self.total_cost_usd += result.cost_usd.max(0.0);
        self.total_turns = self.total_turns.saturating_add(result.turns_used);
        self.phase_results.insert(result.agent_id.clone(), result);
    }

    /// Add spend from a phase that produced no result (failed or aborted)
    pub fn record_spend(&mut self, cost_usd: f64, turns: u32) {
        self.total_cost_usd += cost_usd.max(0.0);
        self.total_turns = self.total_turns.saturating_add(turns);
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Verdict of a pre/post-phase hook. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl HookResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Classification carried by `workflow-error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    HookRejected,
    BudgetExceeded,
    AgentFailed,
    RollbackFailed,
    /// A checkpoint was required but could not be taken
    CheckpointUnavailable,
    Rejected,
    Persistence,
}

/// Lifecycle events emitted by a workflow run, in strict order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        session_id: String,
        workflow_name: String,
        total_phases: usize,
        resumed: bool,
    },
    PhaseStarted {
        session_id: String,
        phase_index: usize,
        agent_id: String,
        display_name: String,
    },
    /// Running spend including the in-flight phase; never decreases
    CostUpdate {
        session_id: String,
        phase_index: usize,
        current_cost_usd: f64,
        turns_used: u32,
    },
    PhaseCompleted {
        session_id: String,
        phase_index: usize,
        result: PhaseResult,
    },
    /// The run is suspended until `approve` or `reject` arrives
    ApprovalRequired {
        session_id: String,
        phase_index: usize,
        agent_id: String,
    },
    WorkflowError {
        session_id: String,
        phase_index: Option<usize>,
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    WorkflowCompleted {
        session_id: String,
        total_cost_usd: f64,
        total_turns: u32,
    },
}

/// Line prefix used when streaming events to a supervising process
pub const EVENT_LINE_PREFIX: &str = "__FF_EVENT__:";

impl WorkflowEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { session_id, .. }
            | Self::PhaseStarted { session_id, .. }
            | Self::CostUpdate { session_id, .. }
            | Self::PhaseCompleted { session_id, .. }
            | Self::ApprovalRequired { session_id, .. }
            | Self::WorkflowError { session_id, .. }
            | Self::WorkflowCompleted { session_id, .. } => session_id,
        }
    }

    /// `workflow-completed` and non-recoverable `workflow-error` end a stream
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::WorkflowCompleted { .. } => true,
            Self::WorkflowError { recoverable, .. } => !recoverable,
            _ => false,
        }
    }

    /// Parse a line produced by [`WorkflowEvent::emit`]
    pub fn parse_line(line: &str) -> Option<Self> {
        line.strip_prefix(EVENT_LINE_PREFIX)
            .and_then(|json| serde_json::from_str(json).ok())
    }

    /// Emit this event to stderr for a supervising process
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("{}{}", EVENT_LINE_PREFIX, json);
            let _ = std::io::stderr().flush();
        }
    }
}

// ============================================================================
// Console Logging Macros
// ============================================================================
// Colored, human-readable progress for the CLI. Structured logs go through
// `tracing`; these only decorate stdout.
// ============================================================================

/// Logs the start of a workflow phase with a header and description.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_phase_start_console;
/// log_phase_start_console!(1, "Design", "architect");
/// ```
///
/// Outputs:
/// ```text
/// ═══ PHASE 1: Design ═══
/// architect
/// ```
#[macro_export]
macro_rules! log_phase_start_console {
    ($phase:expr, $title:expr, $description:expr) => {
        println!("\x1b[1;36m═══ PHASE {}: {} ═══\x1b[0m", $phase, $title);
        println!("\x1b[36m{}\x1b[0m", $description);
    };
}

/// Logs the completion of a workflow phase.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_phase_complete_console;
/// log_phase_complete_console!(1);
/// ```
#[macro_export]
macro_rules! log_phase_complete_console {
    ($phase:expr) => {
        println!("\x1b[32m✓ Phase {} complete\x1b[0m", $phase);
    };
}

/// Logs spend for a phase or a whole run.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_stats;
/// log_stats!(3, 0.0234, 1.2);
/// ```
///
/// Outputs:
/// ```text
/// Statistics: 3 turns, $0.0234 (running total $1.2000)
/// ```
#[macro_export]
macro_rules! log_stats {
    ($turns:expr, $cost_usd:expr, $total_cost_usd:expr) => {
        println!(
            "\x1b[2mStatistics: {} turns, ${:.4} (running total ${:.4})\x1b[0m",
            $turns, $cost_usd, $total_cost_usd
        );
    };
}

/// Logs an informational message.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_info;
/// log_info!("Resuming session {}", "20250101-000000-abcd1234");
/// ```
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_warning;
/// log_warning!("Checkpoint skipped");
/// ```
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a failed step.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_failure;
/// log_failure!("Phase {} failed", 2);
/// ```
#[macro_export]
macro_rules! log_failure {
    ($message:expr) => {
        println!("\x1b[31m✗ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[31m✗ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}
