//! Work items produced by an external diagnosis pipeline
//!
//! A work item is a YAML or JSON document describing a problem that was
//! found. It is turned into the task description of a workflow run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::utils::parse_yaml_or_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default)]
    pub title: Option<String>,
    pub diagnosis: String,
    pub priority: Priority,
    /// Lower tiers are handled first
    pub tier: u32,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

impl WorkItem {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read work item {}", path.display()))?;
        parse_yaml_or_json(&text)
            .with_context(|| format!("Failed to parse work item {}", path.display()))
    }

    pub fn to_task_description(&self) -> String {
        let mut task = match &self.title {
            Some(title) => format!("{}\n\n", title),
            None => String::new(),
        };
        task.push_str(&format!(
            "Priority: {} (tier {})\n\nDiagnosis:\n{}\n",
            self.priority,
            self.tier,
            self.diagnosis.trim()
        ));
        if !self.affected_files.is_empty() {
            task.push_str("\nAffected files:\n");
            for file in &self.affected_files {
                task.push_str(&format!("- {}\n", file));
            }
        }
        task
    }
}
