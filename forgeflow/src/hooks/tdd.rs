//! TDD enforcement hook
//!
//! Runs before implementation. Passes only when the test-generation phase
//! produced tests and at least one of them currently fails.

use forgeflow_sdk::{async_trait, HookResult, PhaseResult};
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tracing::info;

use super::{HookContext, PhaseHook};

pub const TDD_HOOK_NAME: &str = "tdd-enforcement";

/// Aggregate counts from one test-suite run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestRunSummary {
    pub passed: u64,
    pub failed: u64,
    /// The runner exited with status zero
    pub exit_success: bool,
    #[serde(skip)]
    pub raw_output: String,
}

impl TestRunSummary {
    /// Sum every `N passed` and `N failed` occurrence in `output`
    pub fn parse(output: &str, exit_success: bool) -> Self {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let mut summary = Self {
            exit_success,
            raw_output: output.to_string(),
            ..Self::default()
        };

        let Some(pattern) = PATTERN
            .get_or_init(|| Regex::new(r"(?i)\b(\d+)\s+(passed|failed)\b").ok())
            .as_ref()
        else {
            return summary;
        };

        for caps in pattern.captures_iter(output) {
            let count: u64 = caps[1].parse().unwrap_or(0);
            if caps[2].eq_ignore_ascii_case("passed") {
                summary.passed += count;
            } else {
                summary.failed += count;
            }
        }
        summary
    }

    /// A failing test, or a suite that did not exit cleanly (e.g. tests that do not compile yet)
    pub fn is_red(&self) -> bool {
        self.failed > 0 || !self.exit_success
    }
}

/// Runs the project's test suite
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, working_directory: &Path) -> std::io::Result<TestRunSummary>;
}

/// Runs a shell-free command and parses its combined output.
/// A non-zero exit status is expected when tests fail and is recorded, not raised.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, working_directory: &Path) -> std::io::Result<TestRunSummary> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "test command is empty",
            ));
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(working_directory)
            .output()
            .await?;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(TestRunSummary::parse(&combined, output.status.success()))
    }
}

pub struct TddEnforcementHook {
    test_generation_agent: String,
    runner: Arc<dyn TestRunner>,
}

impl TddEnforcementHook {
    pub fn new(test_generation_agent: impl Into<String>, runner: Arc<dyn TestRunner>) -> Self {
        Self {
            test_generation_agent: test_generation_agent.into(),
            runner,
        }
    }
}

/// Number of tests a test-generation phase reports having written
fn generated_test_count(result: &PhaseResult) -> usize {
    for key in ["tests_generated", "testsGenerated"] {
        if let Some(count) = result.output.get(key).and_then(|value| value.as_u64()) {
            return count as usize;
        }
    }
    if let Some(tests) = result.output.get("tests").and_then(|value| value.as_array()) {
        return tests.len();
    }
    result
        .files_created
        .iter()
        .chain(result.files_modified.iter())
        .filter(|path| looks_like_test_file(path))
        .count()
}

fn looks_like_test_file(path: &Path) -> bool {
    let in_test_dir = path.components().any(|component| {
        matches!(
            component.as_os_str().to_str(),
            Some("tests" | "test" | "__tests__" | "spec")
        )
    });
    let stem_is_test = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| {
            let stem = stem.to_ascii_lowercase();
            stem.starts_with("test_")
                || stem.ends_with("_test")
                || stem.ends_with(".test")
                || stem.ends_with(".spec")
                || stem.ends_with("_tests")
        })
        .unwrap_or(false);
    in_test_dir || stem_is_test
}

#[async_trait]
impl PhaseHook for TddEnforcementHook {
    fn name(&self) -> &str {
        TDD_HOOK_NAME
    }

    fn description(&self) -> &str {
        "Requires generated tests to exist and fail before implementation starts"
    }

    async fn execute(&self, context: &HookContext) -> HookResult {
        let Some(test_phase) = context.previous_results.get(&self.test_generation_agent) else {
            return HookResult::fail(format!(
                "Test generation phase '{}' has not run",
                self.test_generation_agent
            ));
        };
        if !test_phase.success {
            return HookResult::fail(format!(
                "Test generation phase '{}' did not succeed",
                self.test_generation_agent
            ));
        }

        let generated = generated_test_count(test_phase);
        if generated == 0 {
            return HookResult::fail(format!(
                "Test generation phase '{}' produced no tests",
                self.test_generation_agent
            ));
        }

        let summary = match self.runner.run(&context.working_directory).await {
            Ok(summary) => summary,
            Err(e) => return HookResult::fail(format!("Failed to run the test suite: {}", e)),
        };

        if context.verbose {
            info!(
                passed = summary.passed,
                failed = summary.failed,
                exit_success = summary.exit_success,
                generated,
                "Test suite finished"
            );
        }

        let data = serde_json::json!({
            "tests_generated": generated,
            "passed": summary.passed,
            "failed": summary.failed,
            "exit_success": summary.exit_success,
        });

        if !summary.is_red() {
            return HookResult::fail(format!(
                "TDD VIOLATION: no failing tests ({} passed). Generated tests must fail before implementation.",
                summary.passed
            ))
            .with_data(data);
        }

        HookResult::pass().with_data(data)
    }
}
