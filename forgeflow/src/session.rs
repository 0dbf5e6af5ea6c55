//! Session persistence
//!
//! One JSON file per session, `<root>/<session id>.json`, holding the
//! workflow state and a small metadata envelope. Writes go to a temporary
//! file first and are renamed into place, so a crash never leaves a
//! half-written session behind.

use chrono::{DateTime, Duration, Utc};
use forgeflow_sdk::{WorkflowState, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const SESSION_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    #[error("session I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub last_updated_at: DateTime<Utc>,
}

/// On-disk layout of a session file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub metadata: SessionMetadata,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub workflow: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub current_phase: usize,
    pub total_cost_usd: f64,
    pub last_updated_at: DateTime<Utc>,
}

impl From<&StoredSession> for SessionSummary {
    fn from(stored: &StoredSession) -> Self {
        Self {
            session_id: stored.state.session_id.clone(),
            workflow: stored.state.workflow_name.clone(),
            description: stored.state.task_description.clone(),
            status: stored.state.status,
            current_phase: stored.state.current_phase_index,
            total_cost_usd: stored.state.total_cost_usd,
            last_updated_at: stored.metadata.last_updated_at,
        }
    }
}

/// `<UTC timestamp>-<8 random hex chars>`, sortable by creation time
pub fn generate_session_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &random[..8])
}

fn validate_id(session_id: &str) -> Result<(), SessionError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(session_id.to_string()))
    }
}

/// Directory-backed store of session files
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", session_id, SESSION_EXTENSION))
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
        move |source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub async fn save(&self, state: &WorkflowState) -> Result<(), SessionError> {
        self.save_at(state, Utc::now()).await
    }

    /// Save with an explicit update timestamp
    pub async fn save_at(
        &self,
        state: &WorkflowState,
        last_updated_at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        validate_id(&state.session_id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io_error(&self.root))?;

        let stored = StoredSession {
            metadata: SessionMetadata { last_updated_at },
            state: state.clone(),
        };
        let path = self.session_path(&state.session_id);
        let json = serde_json::to_string_pretty(&stored).map_err(|source| {
            SessionError::Malformed {
                path: path.clone(),
                source,
            }
        })?;

        let tmp = path.with_extension(format!("{}.tmp", SESSION_EXTENSION));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(Self::io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(Self::io_error(&path))?;

        debug!(session_id = %state.session_id, status = %state.status, "Saved session");
        Ok(())
    }

    /// `None` when no file exists for `session_id`
    pub async fn load(&self, session_id: &str) -> Result<Option<StoredSession>, SessionError> {
        validate_id(session_id)?;
        let path = self.session_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|source| SessionError::Malformed { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SessionError::Io { path, source }),
        }
    }

    async fn load_all(&self) -> Result<Vec<StoredSession>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SessionError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(Self::io_error(&self.root))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_EXTENSION) {
                continue;
            }
            let json = match tokio::fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_str::<StoredSession>(&json) {
                Ok(stored) => sessions.push(stored),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed session file");
                }
            }
        }

        sessions.sort_by(|a, b| b.metadata.last_updated_at.cmp(&a.metadata.last_updated_at));
        Ok(sessions)
    }

    /// All sessions, most recently updated first
    pub async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        Ok(self.load_all().await?.iter().map(SessionSummary::from).collect())
    }

    /// Returns whether a file was removed
    pub async fn delete(&self, session_id: &str) -> Result<bool, SessionError> {
        validate_id(session_id)?;
        let path = self.session_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(session_id, "Deleted session");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SessionError::Io { path, source }),
        }
    }

    /// Delete finished sessions last updated more than `older_than_days` ago.
    ///
    /// Failed and cancelled sessions are always eligible, completed ones only
    /// with `include_completed`. Running and awaiting sessions are never
    /// touched. Returns the deleted session ids.
    pub async fn cleanup(
        &self,
        older_than_days: u32,
        include_completed: bool,
    ) -> Result<Vec<String>, SessionError> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let mut deleted = Vec::new();

        for stored in self.load_all().await? {
            let eligible = match stored.state.status {
                WorkflowStatus::Failed | WorkflowStatus::Cancelled => true,
                WorkflowStatus::Completed => include_completed,
                WorkflowStatus::Running | WorkflowStatus::AwaitingApproval => false,
            };
            if eligible && stored.metadata.last_updated_at < cutoff {
                let session_id = stored.state.session_id;
                if self.delete(&session_id).await? {
                    deleted.push(session_id);
                }
            }
        }

        Ok(deleted)
    }

    /// Most recently updated session that can still be resumed
    pub async fn get_resumable(&self) -> Result<Option<StoredSession>, SessionError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|stored| stored.state.status.is_resumable()))
    }
}
