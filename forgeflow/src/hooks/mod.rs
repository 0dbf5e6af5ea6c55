//! Pre/post-phase hooks
//!
//! A hook is a named check run before or after a phase. Hooks are looked up
//! by name in a [`HookRegistry`] that is built once and handed to the
//! orchestrator. Executing a name that was never registered yields a failed
//! [`HookResult`] rather than an error, so a typo in a workflow definition
//! stops the phase instead of crashing the run.

pub mod tdd;

pub use tdd::{CommandTestRunner, TddEnforcementHook, TestRunSummary, TestRunner};

use forgeflow_sdk::{async_trait, HookResult, PhaseResult, WorkflowState};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a hook may inspect
#[derive(Debug, Clone)]
pub struct HookContext {
    pub working_directory: PathBuf,
    /// Results of phases completed so far, keyed by agent id
    pub previous_results: BTreeMap<String, PhaseResult>,
    /// Snapshot of the live run
    pub state: WorkflowState,
    pub verbose: bool,
}

impl HookContext {
    pub fn from_state(state: &WorkflowState, verbose: bool) -> Self {
        Self {
            working_directory: state.working_directory.clone(),
            previous_results: state.phase_results.clone(),
            state: state.clone(),
            verbose,
        }
    }
}

#[async_trait]
pub trait PhaseHook: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, context: &HookContext) -> HookResult;
}

/// Name → hook lookup table
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn PhaseHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under its own name, replacing any previous hook of that name
    pub fn register(&mut self, hook: Arc<dyn PhaseHook>) {
        self.hooks.insert(hook.name().to_string(), hook);
    }

    pub fn with_hook(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.register(hook);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PhaseHook>> {
        self.hooks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// `(name, description)` pairs sorted by name
    pub fn list(&self) -> Vec<(String, String)> {
        let mut hooks: Vec<(String, String)> = self
            .hooks
            .values()
            .map(|hook| (hook.name().to_string(), hook.description().to_string()))
            .collect();
        hooks.sort();
        hooks
    }

    pub async fn execute(&self, name: &str, context: &HookContext) -> HookResult {
        let Some(hook) = self.get(name) else {
            warn!(hook = name, "Unknown hook");
            return HookResult::fail(format!("Unknown hook: {}", name));
        };

        let result = hook.execute(context).await;
        for warning in &result.warnings {
            warn!(hook = name, warning = %warning, "Hook warning");
        }
        debug!(hook = name, passed = result.passed, "Hook finished");
        result
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.list())
            .finish()
    }
}
