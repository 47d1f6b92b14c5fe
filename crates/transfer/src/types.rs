use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkup_protocol::{UploadInfo, UploadState};

use crate::PENDING_DIR;

/// Lifecycle state of an upload session.
///
/// Transitions are one-way: `Open` may repeat, everything else is terminal
/// except `Verifying`, which only exists inside the finish critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Verifying,
    Completed,
    Failed,
    Expired,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SessionState> for UploadState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Open => UploadState::Open,
            SessionState::Verifying => UploadState::Verifying,
            SessionState::Completed => UploadState::Completed,
            SessionState::Failed => UploadState::Failed,
            SessionState::Expired => UploadState::Expired,
        }
    }
}

/// Durable metadata record, stored next to the artifact as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: String, declared_size: Option<u64>, target_path: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            declared_size,
            target_path,
            expected_checksum: None,
            state: SessionState::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Wall-clock time since the record was last updated.
    pub(crate) fn age(&self) -> Duration {
        (Utc::now() - self.updated_at).to_std().unwrap_or_default()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub record: SessionRecord,
    /// Current artifact length in bytes.
    pub current_size: u64,
    /// Time since the last successful write.
    pub idle: Duration,
}

impl SessionSnapshot {
    pub fn to_info(&self) -> UploadInfo {
        UploadInfo {
            upload_id: self.record.id.clone(),
            state: self.record.state.into(),
            declared_size: self.record.declared_size,
            target_path: self.record.target_path.clone(),
            current_size: self.current_size,
            idle_secs: self.idle.as_secs(),
        }
    }
}

/// Directory holding everything that belongs to session `id`.
pub fn session_dir(id: &str) -> PathBuf {
    Path::new(PENDING_DIR).join(id)
}

/// Location of the artifact for session `id`.
pub fn artifact_path(id: &str) -> PathBuf {
    session_dir(id).join("data")
}

/// Location of the metadata record for session `id`.
pub fn record_path(id: &str) -> PathBuf {
    session_dir(id).join("metadata.json")
}
