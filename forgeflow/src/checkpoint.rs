//! Git checkpoints and rollback
//!
//! A checkpoint is a lightweight tag on `HEAD` taken before a phase runs:
//!
//! ```text
//! ff-checkpoint/<session id>/pre-<phase index>-<phase slug>
//! ```
//!
//! Tag names are a pure function of their inputs, so creating the same
//! checkpoint twice is a no-op success. Everything goes through the `git`
//! binary in the working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::STATE_DIR_NAME;

pub const TAG_NAMESPACE: &str = "ff-checkpoint";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to run git in {dir}: {source}")]
    Spawn {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("checkpoint tag not found: {0}")]
    MissingTag(String),

    #[error("{0} is not inside a git work tree")]
    NotARepository(PathBuf),
}

/// A created (or already existing) checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub tag_name: String,
    pub commit_hash: String,
    pub session_id: String,
    pub phase_index: usize,
    pub phase_slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Created(CheckpointRecord),
    /// No checkpoint could be taken; the workflow may still proceed
    Skipped { reason: String },
}

/// Lower-case, runs of non-alphanumerics collapsed to `-`, no leading or trailing `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

pub fn session_tag_prefix(session_id: &str) -> String {
    format!("{}/{}/", TAG_NAMESPACE, session_id)
}

pub fn tag_name(session_id: &str, phase_index: usize, phase_name: &str) -> String {
    format!(
        "{}pre-{}-{}",
        session_tag_prefix(session_id),
        phase_index,
        slugify(phase_name)
    )
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn git(dir: &Path, args: &[&str]) -> Result<GitOutput, CheckpointError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|source| CheckpointError::Spawn {
            dir: dir.to_path_buf(),
            source,
        })?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run git and require success
async fn git_checked(dir: &Path, args: &[&str]) -> Result<String, CheckpointError> {
    let output = git(dir, args).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(CheckpointError::Git {
            command: args.join(" "),
            stderr: output.stderr,
        })
    }
}

pub async fn is_work_tree(dir: &Path) -> bool {
    match git(dir, &["rev-parse", "--is-inside-work-tree"]).await {
        Ok(output) => output.success && output.stdout == "true",
        Err(_) => false,
    }
}

/// Commit hash of `HEAD`, `None` on an unborn branch
pub async fn head_commit(dir: &Path) -> Result<Option<String>, CheckpointError> {
    let output = git(dir, &["rev-parse", "-q", "--verify", "HEAD^{commit}"]).await?;
    Ok(output.success.then_some(output.stdout))
}

/// True when tracked or untracked changes are present
async fn has_uncommitted_changes(dir: &Path) -> Result<bool, CheckpointError> {
    let status = git_checked(dir, &["status", "--porcelain"]).await?;
    Ok(!status.is_empty())
}

async fn resolve_tag(dir: &Path, tag: &str) -> Result<Option<String>, CheckpointError> {
    let spec = format!("refs/tags/{}^{{commit}}", tag);
    let output = git(dir, &["rev-parse", "-q", "--verify", &spec]).await?;
    Ok(output.success.then_some(output.stdout))
}

/// Tag `HEAD` before a phase. Soft-fails outside a git checkout or on an unborn `HEAD`.
pub async fn create_checkpoint(
    working_directory: &Path,
    session_id: &str,
    phase_index: usize,
    phase_name: &str,
) -> Result<CheckpointOutcome, CheckpointError> {
    if !is_work_tree(working_directory).await {
        return Ok(CheckpointOutcome::Skipped {
            reason: format!(
                "{} is not inside a git work tree",
                working_directory.display()
            ),
        });
    }

    let Some(head) = head_commit(working_directory).await? else {
        return Ok(CheckpointOutcome::Skipped {
            reason: "repository has no commits yet".to_string(),
        });
    };

    let tag = tag_name(session_id, phase_index, phase_name);
    let record = |commit_hash: String| CheckpointRecord {
        tag_name: tag.clone(),
        commit_hash,
        session_id: session_id.to_string(),
        phase_index,
        phase_slug: slugify(phase_name),
    };

    if let Some(existing) = resolve_tag(working_directory, &tag).await? {
        debug!(tag = %tag, commit = %existing, "Checkpoint already exists");
        return Ok(CheckpointOutcome::Created(record(existing)));
    }

    git_checked(working_directory, &["tag", &tag, &head]).await?;
    info!(tag = %tag, commit = %head, "Created checkpoint");

    if has_uncommitted_changes(working_directory).await? {
        warn!(
            tag = %tag,
            "Uncommitted changes are not part of the checkpoint and are lost on rollback"
        );
    }

    Ok(CheckpointOutcome::Created(record(head)))
}

/// Hard-reset to `tag` and remove untracked files. Ignored files are kept.
pub async fn rollback_to_checkpoint(
    working_directory: &Path,
    tag: &str,
) -> Result<(), CheckpointError> {
    if !is_work_tree(working_directory).await {
        return Err(CheckpointError::NotARepository(
            working_directory.to_path_buf(),
        ));
    }

    let Some(commit) = resolve_tag(working_directory, tag).await? else {
        return Err(CheckpointError::MissingTag(tag.to_string()));
    };

    git_checked(working_directory, &["reset", "--hard", &commit]).await?;
    // no -x: ignored files survive, and so does the engine's own state directory
    let keep_state = format!("{}/", STATE_DIR_NAME);
    git_checked(working_directory, &["clean", "-fd", "-e", &keep_state]).await?;

    info!(tag = %tag, commit = %commit, "Rolled back to checkpoint");
    Ok(())
}

/// Checkpoint tags of one session, sorted by phase index
pub async fn list_checkpoints(
    working_directory: &Path,
    session_id: &str,
) -> Result<Vec<String>, CheckpointError> {
    if !is_work_tree(working_directory).await {
        return Ok(Vec::new());
    }

    let prefix = session_tag_prefix(session_id);
    let pattern = format!("{}*", prefix);
    let listing = git_checked(working_directory, &["tag", "-l", &pattern]).await?;

    let mut tags: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|tag| tag.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    tags.sort_by_key(|tag| phase_index_of(tag, &prefix).unwrap_or(usize::MAX));
    Ok(tags)
}

fn phase_index_of(tag: &str, prefix: &str) -> Option<usize> {
    tag.strip_prefix(prefix)?
        .strip_prefix("pre-")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

/// Delete every checkpoint tag of one session. Returns the deleted tag names.
pub async fn cleanup_checkpoints(
    working_directory: &Path,
    session_id: &str,
) -> Result<Vec<String>, CheckpointError> {
    let tags = list_checkpoints(working_directory, session_id).await?;
    if tags.is_empty() {
        return Ok(tags);
    }

    let mut args = vec!["tag", "-d"];
    args.extend(tags.iter().map(String::as_str));
    git_checked(working_directory, &args).await?;

    info!(session_id, deleted = tags.len(), "Deleted checkpoint tags");
    Ok(tags)
}

/// Commits reachable from `HEAD` but not from `base`, oldest first
pub async fn commits_since(
    working_directory: &Path,
    base: &str,
) -> Result<Vec<String>, CheckpointError> {
    let range = format!("{}..HEAD", base);
    let listing = git_checked(working_directory, &["rev-list", "--reverse", &range]).await?;
    Ok(listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}
