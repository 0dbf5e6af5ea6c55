//! Workflow catalog
//!
//! Built-in definitions are embedded at compile time. Extra definitions are
//! loaded from `*.yaml` files in a directory and replace built-ins of the
//! same name. Every definition is validated before it enters the catalog.

use forgeflow_sdk::WorkflowDefinition;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const BUILTIN_WORKFLOWS: &[(&str, &str)] = &[
    ("feature.yaml", include_str!("../workflows/feature.yaml")),
    ("bugfix.yaml", include_str!("../workflows/bugfix.yaml")),
];

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    Unknown(String),

    #[error("invalid workflow '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("failed to read workflow file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Check structural invariants of a definition
pub fn validate(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let invalid = |reason: String| WorkflowError::Invalid {
        name: definition.name.clone(),
        reason,
    };

    if definition.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    if definition.phases.is_empty() {
        return Err(invalid("workflow has no phases".to_string()));
    }

    let mut seen = HashSet::new();
    for (index, phase) in definition.phases.iter().enumerate() {
        if phase.agent_id.trim().is_empty() {
            return Err(invalid(format!("phase {} has an empty agent id", index)));
        }
        if !seen.insert(phase.agent_id.as_str()) {
            return Err(invalid(format!(
                "agent '{}' appears in more than one phase",
                phase.agent_id
            )));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding only the embedded workflows
    pub fn builtin() -> Result<Self, WorkflowError> {
        let mut catalog = Self::new();
        for (file, yaml) in BUILTIN_WORKFLOWS {
            let definition = parse_definition(yaml, Path::new(file))?;
            catalog.insert(definition)?;
        }
        Ok(catalog)
    }

    /// Validate and add `definition`, replacing one of the same name
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        validate(&definition)?;
        if self.workflows.contains_key(&definition.name) {
            info!(workflow = %definition.name, "Overriding workflow definition");
        }
        self.workflows.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`. Returns the number loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, WorkflowError> {
        let read_error = |source| WorkflowError::Read {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(read_error)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        for path in &paths {
            let yaml = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
                path: path.clone(),
                source,
            })?;
            let definition = parse_definition(&yaml, path)?;
            debug!(workflow = %definition.name, path = %path.display(), "Loaded workflow");
            self.insert(definition)?;
        }

        Ok(paths.len())
    }

    pub fn get(&self, name: &str) -> Result<&WorkflowDefinition, WorkflowError> {
        self.workflows
            .get(name)
            .ok_or_else(|| WorkflowError::Unknown(name.to_string()))
    }

    /// Definitions sorted by name
    pub fn list(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }
}

fn parse_definition(yaml: &str, path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml::from_str(yaml).map_err(|source| WorkflowError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
