//! Engine configuration
//!
//! Configuration is layered: built-in defaults, then a YAML file, then
//! environment variables (a `.env` file is honoured through `dotenv`).
//! Invalid budget settings are rejected while the configuration is being
//! built, never on first use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_MAX_BUDGET_USD: &str = "FORGEFLOW_MAX_BUDGET_USD";
pub const ENV_MAX_TURNS_PER_AGENT: &str = "FORGEFLOW_MAX_TURNS_PER_AGENT";
pub const ENV_TEST_COMMAND: &str = "FORGEFLOW_TEST_COMMAND";

/// Directory, relative to the working directory, holding engine state
pub const STATE_DIR_NAME: &str = ".forgeflow";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_budget_usd must be a positive number, got {0}")]
    NonPositiveBudget(f64),

    #[error("max_turns_per_agent must be greater than zero")]
    ZeroTurns,

    #[error("max_total_turns must be greater than zero when set")]
    ZeroTotalTurns,

    #[error("preserve_turns must be greater than zero")]
    ZeroPreserveTurns,

    #[error("{name} must be at least {min} characters, got {value}")]
    CharCapTooSmall {
        name: &'static str,
        value: usize,
        min: usize,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

// ============================================================================
// Budget
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct RawBudgetConfig {
    #[serde(default = "default_max_budget_usd")]
    max_budget_usd: f64,
    #[serde(default = "default_max_turns_per_agent")]
    max_turns_per_agent: u32,
    #[serde(default)]
    max_total_turns: Option<u32>,
}

/// Spend limits for a run. Only constructible with valid values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBudgetConfig")]
pub struct BudgetConfig {
    max_budget_usd: f64,
    max_turns_per_agent: u32,
    max_total_turns: Option<u32>,
}

impl BudgetConfig {
    pub fn new(max_budget_usd: f64, max_turns_per_agent: u32) -> Result<Self, ConfigError> {
        // NaN fails this comparison too
        if !(max_budget_usd > 0.0) || !max_budget_usd.is_finite() {
            return Err(ConfigError::NonPositiveBudget(max_budget_usd));
        }
        if max_turns_per_agent == 0 {
            return Err(ConfigError::ZeroTurns);
        }
        Ok(Self {
            max_budget_usd,
            max_turns_per_agent,
            max_total_turns: None,
        })
    }

    pub fn with_max_total_turns(mut self, max_total_turns: u32) -> Result<Self, ConfigError> {
        if max_total_turns == 0 {
            return Err(ConfigError::ZeroTotalTurns);
        }
        self.max_total_turns = Some(max_total_turns);
        Ok(self)
    }

    pub fn max_budget_usd(&self) -> f64 {
        self.max_budget_usd
    }

    pub fn max_turns_per_agent(&self) -> u32 {
        self.max_turns_per_agent
    }

    pub fn max_total_turns(&self) -> Option<u32> {
        self.max_total_turns
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: default_max_budget_usd(),
            max_turns_per_agent: default_max_turns_per_agent(),
            max_total_turns: None,
        }
    }
}

impl TryFrom<RawBudgetConfig> for BudgetConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBudgetConfig) -> Result<Self, Self::Error> {
        let config = Self::new(raw.max_budget_usd, raw.max_turns_per_agent)?;
        match raw.max_total_turns {
            Some(total) => config.with_max_total_turns(total),
            None => Ok(config),
        }
    }
}

fn default_max_budget_usd() -> f64 {
    10.0
}

fn default_max_turns_per_agent() -> u32 {
    50
}

// ============================================================================
// Context window
// ============================================================================

/// Smallest accepted character cap; a truncation marker must always fit
pub const MIN_CHAR_CAP: usize = 128;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawTruncationLimits {
    shell_head_lines: usize,
    shell_tail_lines: usize,
    file_read_max_chars: usize,
    search_max_matches: usize,
    listing_max_paths: usize,
    generic_max_chars: usize,
}

impl Default for RawTruncationLimits {
    fn default() -> Self {
        let limits = TruncationLimits::default();
        Self {
            shell_head_lines: limits.shell_head_lines,
            shell_tail_lines: limits.shell_tail_lines,
            file_read_max_chars: limits.file_read_max_chars,
            search_max_matches: limits.search_max_matches,
            listing_max_paths: limits.listing_max_paths,
            generic_max_chars: limits.generic_max_chars,
        }
    }
}

/// Per-tool output limits for layer-1 truncation
///
/// `generic_max_chars` also bounds the total size of line-policy output, so
/// a single huge line cannot slip through a line cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTruncationLimits")]
pub struct TruncationLimits {
    pub shell_head_lines: usize,
    pub shell_tail_lines: usize,
    pub file_read_max_chars: usize,
    pub search_max_matches: usize,
    pub listing_max_paths: usize,
    pub generic_max_chars: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            shell_head_lines: 150,
            shell_tail_lines: 150,
            file_read_max_chars: 40_000,
            search_max_matches: 100,
            listing_max_paths: 200,
            generic_max_chars: 20_000,
        }
    }
}

impl TryFrom<RawTruncationLimits> for TruncationLimits {
    type Error = ConfigError;

    fn try_from(raw: RawTruncationLimits) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("file_read_max_chars", raw.file_read_max_chars),
            ("generic_max_chars", raw.generic_max_chars),
        ] {
            if value < MIN_CHAR_CAP {
                return Err(ConfigError::CharCapTooSmall {
                    name,
                    value,
                    min: MIN_CHAR_CAP,
                });
            }
        }
        Ok(Self {
            shell_head_lines: raw.shell_head_lines,
            shell_tail_lines: raw.shell_tail_lines,
            file_read_max_chars: raw.file_read_max_chars,
            search_max_matches: raw.search_max_matches,
            listing_max_paths: raw.listing_max_paths,
            generic_max_chars: raw.generic_max_chars,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawCompactionConfig {
    threshold_tokens: usize,
    preserve_turns: usize,
}

impl Default for RawCompactionConfig {
    fn default() -> Self {
        let config = CompactionConfig::default();
        Self {
            threshold_tokens: config.threshold_tokens,
            preserve_turns: config.preserve_turns,
        }
    }
}

/// Layer-2 whole-history compaction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCompactionConfig")]
pub struct CompactionConfig {
    /// Estimated token count above which the history is compacted
    pub threshold_tokens: usize,
    /// Most recent turn pairs kept verbatim, at least one
    pub preserve_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 100_000,
            preserve_turns: 6,
        }
    }
}

impl TryFrom<RawCompactionConfig> for CompactionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawCompactionConfig) -> Result<Self, Self::Error> {
        if raw.preserve_turns == 0 {
            return Err(ConfigError::ZeroPreserveTurns);
        }
        Ok(Self {
            threshold_tokens: raw.threshold_tokens,
            preserve_turns: raw.preserve_turns,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub truncation: TruncationLimits,
    pub compaction: CompactionConfig,
}

// ============================================================================
// Checkpoints, agents, TDD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub enabled: bool,
    /// Fail a phase instead of proceeding when no checkpoint can be taken
    pub require_version_control: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            require_version_control: false,
        }
    }
}

/// USD per million tokens. Prices the token usage an agent streams before
/// it reports its own total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_write_per_mtok: f64,
    pub cache_read_per_mtok: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_write_per_mtok: 3.75,
            cache_read_per_mtok: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent CLI speaking line-delimited stream-JSON
    pub command: Vec<String>,
    /// Role prompt overrides keyed by agent id
    pub system_prompts: HashMap<String, String>,
    pub pricing: TokenPricing,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            system_prompts: HashMap::new(),
            pricing: TokenPricing::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TddSettings {
    pub test_command: Vec<String>,
    /// Agent whose phase generates the tests
    pub test_generation_agent: String,
}

impl Default for TddSettings {
    fn default() -> Self {
        Self {
            test_command: vec!["cargo".to_string(), "test".to_string()],
            test_generation_agent: "test-generator".to_string(),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    pub context: ContextConfig,
    pub checkpoints: CheckpointSettings,
    pub agent: AgentSettings,
    pub tdd: TddSettings,
    /// Overrides `<working dir>/.forgeflow/sessions`
    pub state_dir: Option<PathBuf>,
    /// Extra workflow definitions (`*.yaml`)
    pub workflows_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, or the per-user config file when present, then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match candidate {
            Some(path) if path.exists() => {
                let yaml = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_yaml_str(&yaml, &path)?
            }
            _ => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_budget = match lookup(ENV_MAX_BUDGET_USD) {
            Some(value) => value.trim().parse::<f64>().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_MAX_BUDGET_USD,
                value,
            })?,
            None => self.budget.max_budget_usd(),
        };
        let max_turns = match lookup(ENV_MAX_TURNS_PER_AGENT) {
            Some(value) => value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_MAX_TURNS_PER_AGENT,
                value,
            })?,
            None => self.budget.max_turns_per_agent(),
        };

        let mut budget = BudgetConfig::new(max_budget, max_turns)?;
        if let Some(total) = self.budget.max_total_turns() {
            budget = budget.with_max_total_turns(total)?;
        }
        self.budget = budget;

        if let Some(command) = lookup(ENV_TEST_COMMAND) {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                self.tdd.test_command = parts;
            }
        }

        Ok(())
    }

    /// Directory holding session files for `working_directory`
    pub fn sessions_dir(&self, working_directory: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| working_directory.join(STATE_DIR_NAME).join("sessions"))
    }
}

/// `<config dir>/forgeflow/config.yaml` for the current user
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "forgeflow")
        .map(|dirs| dirs.config_dir().join("config.yaml"))
}
