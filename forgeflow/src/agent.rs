//! Agent registry and the process-backed agent collaborator
//!
//! [`ProcessAgentInvoker`] drives an agent CLI that prints line-delimited
//! stream-JSON on stdout (`system`, `assistant`, `user` and a final `result`
//! message). Tool calls and results become conversation messages, tool
//! results are truncated on the way in, and the `result` line carries the
//! phase's spend. Until it arrives, spend is estimated from the token usage
//! on each assistant message.

use forgeflow_sdk::{
    async_trait, AgentError, AgentInvoker, AgentRequest, AgentResponse, ContentBlock,
    CostReporter, Message, Role,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::checkpoint;
use crate::config::{AgentSettings, TokenPricing};
use crate::context::compaction::merge_same_role;
use crate::context::ContextWindowManager;
use crate::utils::extract_json;

/// Agent id → invoker
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentInvoker>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_id: impl Into<String>, invoker: Arc<dyn AgentInvoker>) {
        self.agents.insert(agent_id.into(), invoker);
    }

    /// Register one shared invoker under every id in `agent_ids`
    pub fn with_shared<'a>(
        mut self,
        agent_ids: impl IntoIterator<Item = &'a str>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        for agent_id in agent_ids {
            self.register(agent_id, invoker.clone());
        }
        self
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentInvoker>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.ids())
            .finish()
    }
}

/// Role prompt for the built-in agent ids
pub fn default_role_prompt(agent_id: &str) -> &'static str {
    match agent_id {
        "architect" => "You are a software architect. Study the repository and the task, then \
            propose a design: the modules to touch, new types and their responsibilities, and \
            the risks. Do not write code.",
        "spec-writer" => "You are a specification writer. Turn the task and the approved design \
            into precise, testable requirements with explicit edge cases.",
        "test-generator" => "You are a test engineer. Write automated tests for the requirements \
            before any implementation exists. The new tests are expected to fail for now. \
            Report how many tests you wrote as \"tests_generated\".",
        "implementer" => "You are an implementer. Make the failing tests pass with the smallest \
            correct change. Commit your work when the suite is green.",
        "reviewer" => "You are a code reviewer. Review the changes made in this session for \
            correctness, clarity and missing tests. Fix small issues directly.",
        "documenter" => "You are a technical writer. Update user-facing documentation and \
            changelogs for the changes made in this session.",
        _ => "You are a careful software engineer working in this repository.",
    }
}

const OUTPUT_INSTRUCTIONS: &str = "When you are done, end your answer with a JSON object \
in a ```json block summarizing your work. Later phases receive it verbatim.";

/// Stream-JSON protocol state for one invocation
#[derive(Debug, Default)]
pub struct StreamTranscript {
    messages: Vec<Message>,
    tool_names: HashMap<String, String>,
    files_created: Vec<PathBuf>,
    files_modified: Vec<PathBuf>,
    turns: u32,
    final_text: Option<String>,
    cost_usd: Option<f64>,
    reported_turns: Option<u32>,
    is_error: bool,
    pricing: TokenPricing,
    /// Estimated spend per assistant message id
    estimated: HashMap<String, f64>,
}

/// Price one `usage` object
pub fn estimate_usage_cost(usage: &serde_json::Value, pricing: &TokenPricing) -> f64 {
    let tokens = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0) as f64;
    (tokens("input_tokens") * pricing.input_per_mtok
        + tokens("output_tokens") * pricing.output_per_mtok
        + tokens("cache_creation_input_tokens") * pricing.cache_write_per_mtok
        + tokens("cache_read_input_tokens") * pricing.cache_read_per_mtok)
        / 1_000_000.0
}

impl StreamTranscript {
    pub fn new(pricing: TokenPricing) -> Self {
        Self {
            pricing,
            ..Self::default()
        }
    }

    /// The agent's own total once known, the usage estimate before that
    pub fn spend_usd(&self) -> f64 {
        self.cost_usd.unwrap_or_else(|| self.estimated.values().sum())
    }

    /// Feed one stdout line. Returns `(cost, turns)` when spend information changed.
    pub fn ingest_line(
        &mut self,
        line: &str,
        context: &ContextWindowManager,
    ) -> Result<Option<(f64, u32)>, AgentError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                debug!(line, "Ignoring non-JSON agent output");
                return Ok(None);
            }
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                self.ingest_assistant(&value);
                if self.track_usage(&value) {
                    self.turns += 1;
                }
                Ok(Some((self.spend_usd(), self.turns)))
            }
            Some("user") => {
                self.ingest_tool_results(&value, context);
                Ok(None)
            }
            Some("result") => {
                self.is_error = value
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.final_text = value
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.cost_usd = value.get("total_cost_usd").and_then(|v| v.as_f64());
                self.reported_turns = value
                    .get("num_turns")
                    .and_then(|v| v.as_u64())
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
                Ok(Some((self.cost_usd.unwrap_or(0.0), self.turns_used())))
            }
            Some(_) => Ok(None),
            None => Err(AgentError::Protocol(format!(
                "stream message without a type: {}",
                line.chars().take(200).collect::<String>()
            ))),
        }
    }

    /// Record the message's usage estimate. True when this starts a new turn:
    /// one message may be streamed as several lines sharing its id and usage.
    fn track_usage(&mut self, value: &serde_json::Value) -> bool {
        let message = value.get("message");
        let id = message
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string);
        let cost = message
            .and_then(|m| m.get("usage"))
            .map(|usage| estimate_usage_cost(usage, &self.pricing))
            .unwrap_or(0.0);

        match id {
            Some(id) => self.estimated.insert(id, cost).is_none(),
            None => {
                let key = format!("#{}", self.estimated.len());
                self.estimated.insert(key, cost);
                true
            }
        }
    }

    fn ingest_assistant(&mut self, value: &serde_json::Value) {
        let blocks = content_array(value);
        let mut content = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        content.push(ContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                }
                Some("tool_use") => {
                    let id = str_field(block, "id");
                    let name = str_field(block, "name");
                    let input = block.get("input").cloned().unwrap_or_default();
                    self.track_files(&name, &input);
                    self.tool_names.insert(id.clone(), name.clone());
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
                _ => {}
            }
        }
        if !content.is_empty() {
            self.messages.push(Message::new(Role::Assistant, content));
        }
    }

    fn ingest_tool_results(&mut self, value: &serde_json::Value, context: &ContextWindowManager) {
        let mut content = Vec::new();
        for block in content_array(value) {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let tool_use_id = str_field(block, "tool_use_id");
            let tool_name = self.tool_names.get(&tool_use_id).cloned();
            let raw = tool_result_text(block.get("content"));
            let output = context
                .truncate_tool_output(tool_name.as_deref().unwrap_or(""), &raw)
                .output;
            content.push(ContentBlock::ToolResult {
                tool_use_id,
                tool_name,
                output,
                is_error: block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            });
        }
        if !content.is_empty() {
            self.messages.push(Message::new(Role::User, content));
        }
    }

    fn track_files(&mut self, tool_name: &str, input: &serde_json::Value) {
        let path = ["file_path", "notebook_path", "path"]
            .iter()
            .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
            .map(PathBuf::from);
        let Some(path) = path else { return };

        let target = match tool_name {
            "Write" => &mut self.files_created,
            "Edit" | "MultiEdit" | "NotebookEdit" => &mut self.files_modified,
            _ => return,
        };
        if !target.contains(&path) {
            target.push(path);
        }
    }

    pub fn turns_used(&self) -> u32 {
        self.reported_turns.unwrap_or(self.turns)
    }

    pub fn has_result(&self) -> bool {
        self.final_text.is_some() || self.cost_usd.is_some()
    }

    /// Build the response. `prompt` becomes the first transcript message.
    pub fn into_response(self, prompt: String, commits: Vec<String>) -> AgentResponse {
        let turns_used = self.turns_used();
        let final_text = self.final_text.unwrap_or_else(|| {
            self.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(Message::text)
                .unwrap_or_default()
        });

        let files_created = self.files_created;
        let files_modified: Vec<PathBuf> = self
            .files_modified
            .into_iter()
            .filter(|path| !files_created.contains(path))
            .collect();

        let mut transcript = vec![Message::user_text(prompt)];
        transcript.extend(self.messages);

        AgentResponse {
            success: !self.is_error,
            output: extract_json(&final_text)
                .unwrap_or_else(|| serde_json::Value::String(final_text.clone())),
            files_created,
            files_modified,
            commits,
            cost_usd: self.cost_usd.unwrap_or(0.0),
            turns_used,
            transcript: merge_same_role(transcript),
            error: self.is_error.then_some(final_text),
        }
    }
}

fn content_array(value: &serde_json::Value) -> &[serde_json::Value] {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Tool result content is either a string or a list of text blocks
fn tool_result_text(content: Option<&serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Render prior conversation as plain text for a stateless agent process
fn render_context(messages: &[Message]) -> String {
    let mut rendered = String::new();
    for message in messages {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        rendered.push_str(&format!("\n### {}\n", speaker));
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => {
                    rendered.push_str(text);
                    rendered.push('\n');
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    rendered.push_str(&format!("[tool call {}: {}]\n", name, input));
                }
                ContentBlock::ToolResult { output, .. } => {
                    rendered.push_str(&format!("[tool result]\n{}\n", output));
                }
            }
        }
    }
    rendered
}

/// Runs each phase as one agent CLI process
pub struct ProcessAgentInvoker {
    command: Vec<String>,
    system_prompts: HashMap<String, String>,
    pricing: TokenPricing,
    context: ContextWindowManager,
}

impl ProcessAgentInvoker {
    pub fn new(settings: &AgentSettings, context: ContextWindowManager) -> Self {
        Self {
            command: settings.command.clone(),
            system_prompts: settings.system_prompts.clone(),
            pricing: settings.pricing.clone(),
            context,
        }
    }

    fn role_prompt(&self, agent_id: &str) -> &str {
        self.system_prompts
            .get(agent_id)
            .map(String::as_str)
            .unwrap_or_else(|| default_role_prompt(agent_id))
    }

    /// Full prompt written to the agent's stdin
    pub fn build_prompt(&self, request: &AgentRequest) -> String {
        let mut prompt = format!("{}\n\n", self.role_prompt(&request.agent_id));
        if !request.context_messages.is_empty() {
            prompt.push_str("## Conversation so far\n");
            prompt.push_str(&render_context(&request.context_messages));
            prompt.push('\n');
        }
        prompt.push_str(&request.input.render());
        prompt.push_str(&format!(
            "\nBudget remaining: ${:.2}, at most {} turns.\n\n{}\n",
            request.budget_remaining_usd, request.turns_remaining, OUTPUT_INSTRUCTIONS
        ));
        prompt
    }
}

#[async_trait]
impl AgentInvoker for ProcessAgentInvoker {
    async fn invoke(
        &self,
        request: AgentRequest,
        reporter: CostReporter,
    ) -> Result<AgentResponse, AgentError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AgentError::Transport("agent command is empty".to_string()));
        };

        let base = checkpoint::head_commit(&request.working_directory)
            .await
            .ok()
            .flatten();
        let prompt = self.build_prompt(&request);

        let mut child = Command::new(program)
            .args(args)
            .arg("--max-turns")
            .arg(request.turns_remaining.to_string())
            .current_dir(&request.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.command.join(" "),
                source,
            })?;

        // stderr is drained and the prompt written concurrently with reading stdout
        let agent_id = request.agent_id.clone();
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = String::new();
                if let Err(e) = stderr.read_to_string(&mut buffer).await {
                    warn!(agent_id = %agent_id, error = %e, "Failed to read agent stderr");
                }
                buffer
            })
        });

        let stdin_task = child.stdin.take().map(|mut stdin| {
            // dropping stdin at the end of the task closes it so the agent starts
            tokio::spawn(async move { stdin.write_all(prompt.as_bytes()).await })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("agent stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = StreamTranscript::new(self.pricing.clone());

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?
        {
            if let Some((cost, turns)) = transcript.ingest_line(&line, &self.context)? {
                reporter.report(cost, turns);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let write_error = match stdin_task {
            Some(task) => match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };
        if let Some(e) = write_error {
            warn!(
                agent_id = %request.agent_id,
                error = %e,
                "Failed to write the full prompt to the agent"
            );
        }

        if !transcript.has_result() {
            let detail = stderr.trim();
            return Err(if status.success() {
                AgentError::Protocol("agent exited without a result message".to_string())
            } else {
                AgentError::Model(format!(
                    "agent exited with {}: {}",
                    status,
                    if detail.is_empty() { "no output" } else { detail }
                ))
            });
        }
        if !status.success() {
            warn!(agent_id = %request.agent_id, %status, "Agent process exited unsuccessfully");
        }

        let commits = match &base {
            Some(base) => checkpoint::commits_since(&request.working_directory, base)
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(transcript.into_response(request.input.render(), commits))
    }
}
