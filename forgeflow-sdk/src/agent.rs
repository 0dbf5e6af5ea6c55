//! Agent invocation contract
//!
//! The engine never talks to a model directly. It hands an [`AgentRequest`] to
//! an [`AgentInvoker`] and gets an [`AgentResponse`] back. Invokers may report
//! spend while they run through the [`CostReporter`] they are given.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::conversation::Message;

/// Input for one phase: the task plus every earlier phase's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInput {
    pub task_description: String,
    pub phase_index: usize,
    pub agent_id: String,
    pub display_name: String,
    /// Outputs of previously completed phases keyed by agent id
    #[serde(default)]
    pub previous_outputs: BTreeMap<String, serde_json::Value>,
}

impl PhaseInput {
    /// Render the input as the user-facing prompt for this phase
    pub fn render(&self) -> String {
        let mut prompt = format!(
            "# Phase {}: {}\n\n## Task\n{}\n",
            self.phase_index + 1,
            self.display_name,
            self.task_description
        );

        if !self.previous_outputs.is_empty() {
            prompt.push_str("\n## Outputs from earlier phases\n");
            for (agent_id, output) in &self.previous_outputs {
                let rendered = match output {
                    serde_json::Value::String(text) => text.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_default(),
                };
                prompt.push_str(&format!("\n### {}\n{}\n", agent_id, rendered));
            }
        }

        prompt
    }
}

/// Everything an agent needs for one phase
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent_id: String,
    pub input: PhaseInput,
    /// Conversation so far, already truncated and compacted
    pub context_messages: Vec<Message>,
    pub budget_remaining_usd: f64,
    pub turns_remaining: u32,
    pub working_directory: PathBuf,
}

/// What an agent reports back after a phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    pub output: serde_json::Value,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub commits: Vec<String>,
    pub cost_usd: f64,
    pub turns_used: u32,
    /// Messages produced during the phase, appended to the shared conversation
    pub transcript: Vec<Message>,
    /// Reason when `success` is false
    pub error: Option<String>,
}

/// Failures raised by an invoker before it could produce a response
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("failed to spawn agent command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("agent reported an error: {0}")]
    Model(String),

    #[error("malformed agent output: {0}")]
    Protocol(String),
}

/// Incremental spend reported while an agent runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostProgress {
    /// Spend of the current phase so far
    pub cost_usd: f64,
    pub turns_used: u32,
}

/// Sending half used by invokers to report spend mid-phase
#[derive(Debug, Clone)]
pub struct CostReporter {
    tx: mpsc::UnboundedSender<CostProgress>,
}

impl CostReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CostProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report progress. Silently ignored once nobody is listening.
    pub fn report(&self, cost_usd: f64, turns_used: u32) {
        let _ = self.tx.send(CostProgress {
            cost_usd,
            turns_used,
        });
    }
}

/// The external agent-invocation collaborator
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: AgentRequest,
        reporter: CostReporter,
    ) -> Result<AgentResponse, AgentError>;
}
