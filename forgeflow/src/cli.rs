//! Command-line argument definitions for the `forgeflow` binary.

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::orchestrator::RecoveryPolicy;

/// Resumable, budget-bounded orchestration of multi-phase agent workflows
///
/// Runs a workflow (for example design → tests → implementation → review)
/// as a sequence of agent phases, with a git checkpoint before each phase,
/// approval gates, and a session file that allows resuming later.
#[derive(Parser, Debug, Clone)]
#[command(name = "forgeflow")]
#[command(version)]
pub struct Cli {
    /// Path to a YAML configuration file
    ///
    /// Defaults to config.yaml in the per-user configuration directory.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging and verbose hook output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a new workflow run
    Run(RunArgs),

    /// Continue a persisted session
    Resume(ResumeArgs),

    /// Inspect and clean up persisted sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),

    /// Inspect, roll back and clean up checkpoint tags
    #[command(subcommand)]
    Checkpoints(CheckpointsCommand),

    /// List available workflows
    Workflows,
}

/// Options shared by `run` and `resume`
#[derive(ClapArgs, Debug, Clone)]
pub struct ExecutionArgs {
    /// Repository to work in
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Approve every approval gate without asking
    #[arg(long)]
    pub auto_approve: bool,

    /// What to do after a recoverable error
    #[arg(long, value_enum, default_value_t = RecoveryArg::FailFast)]
    pub recovery: RecoveryArg,

    /// Retries per phase with `--recovery auto-retry`
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub max_attempts: u32,

    /// Also stream events as `__FF_EVENT__:` JSON lines on stderr
    #[arg(long)]
    pub events_json: bool,
}

impl ExecutionArgs {
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        match self.recovery {
            RecoveryArg::FailFast => RecoveryPolicy::FailFast,
            RecoveryArg::AwaitDecision => RecoveryPolicy::AwaitDecision,
            RecoveryArg::AutoRetry => RecoveryPolicy::AutoRetry {
                max_attempts: self.max_attempts,
            },
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryArg {
    FailFast,
    AwaitDecision,
    AutoRetry,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Workflow name (see `forgeflow workflows`)
    #[arg(long, short, value_name = "NAME")]
    pub workflow: String,

    /// Task description
    #[arg(long, short, value_name = "TEXT")]
    pub task: Option<String>,

    /// Work item file (YAML or JSON with diagnosis, priority and tier)
    #[arg(long, value_name = "PATH")]
    pub work_item: Option<PathBuf>,

    #[command(flatten)]
    pub execution: ExecutionArgs,
}

impl RunArgs {
    /// Exactly one task source must be given
    pub fn validate(&self) -> Result<()> {
        match (&self.task, &self.work_item) {
            (Some(_), Some(_)) => bail!("--task and --work-item are mutually exclusive"),
            (None, None) => bail!("one of --task or --work-item is required"),
            (Some(task), None) if task.trim().is_empty() => bail!("--task must not be empty"),
            _ => {}
        }
        if self.execution.max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ResumeArgs {
    /// Session to resume; defaults to the newest resumable session
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    #[command(flatten)]
    pub execution: ExecutionArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommand {
    /// List sessions, newest first
    List {
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Show one session as JSON
    Show {
        id: String,
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Delete one session file
    Delete {
        id: String,
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Delete old failed and cancelled sessions (and their checkpoints)
    Cleanup {
        #[arg(long, value_name = "DAYS")]
        older_than_days: u32,

        /// Also delete completed sessions
        #[arg(long)]
        include_completed: bool,

        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointsCommand {
    /// List checkpoint tags of a session
    List {
        #[arg(long, value_name = "ID")]
        session: String,
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Delete checkpoint tags of a session
    Cleanup {
        #[arg(long, value_name = "ID")]
        session: String,
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Reset the working tree to a checkpoint tag
    Rollback {
        #[arg(long, value_name = "TAG")]
        tag: String,
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
}
