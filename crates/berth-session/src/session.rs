//! Session records and the value types used to create, update and list them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use berth_types::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Checkpointed,
    Deleted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Checkpointed => "checkpointed",
            SessionState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionState::Created),
            "active" => Ok(SessionState::Active),
            "checkpointed" => Ok(SessionState::Checkpointed),
            "deleted" => Ok(SessionState::Deleted),
            other => Err(format!("unknown session state '{other}'")),
        }
    }
}

/// Immutable snapshot marker. The snapshot files live outside the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over the sorted relative paths and contents of every file.
    pub fingerprint: String,
    pub file_count: u64,
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub workspace: PathBuf,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Bump `updated_at` and slide the expiry window forward.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        if let Some(ttl) = self.ttl_secs {
            self.expires_at = Some(now + chrono::Duration::seconds(ttl as i64));
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            labels: self.labels.clone(),
            checkpoint_count: self.checkpoints.len(),
            last_completed_stage: self.last_completed_stage.clone(),
        }
    }
}

/// Options for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub labels: Labels,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Overrides the manager's default TTL. `Some(Duration::ZERO)` is treated as no expiry.
    pub ttl: Option<Duration>,
}

impl SessionConfig {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A partial update. Fields left at their defaults are not touched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub state: Option<SessionState>,
    pub set_labels: Labels,
    pub remove_labels: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub last_completed_stage: Option<String>,
}

impl SessionUpdate {
    pub fn state(state: SessionState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn completed_stage(stage: impl Into<String>) -> Self {
        Self {
            last_completed_stage: Some(stage.into()),
            ..Default::default()
        }
    }
}

/// Selects sessions by label equality and, optionally, state.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub labels: Labels,
    pub state: Option<SessionState>,
}

impl SessionFilter {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, session: &Session) -> bool {
        if self.state.is_some_and(|s| s != session.state) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| session.labels.get(k) == Some(v))
    }
}

/// Listing entry for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub labels: Labels,
    pub checkpoint_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<String>,
}

/// Snapshot of matching sessions, oldest first. Can be iterated repeatedly.
#[derive(Debug, Clone, Default)]
pub struct SessionListing {
    pub(crate) items: Vec<SessionSummary>,
}

impl SessionListing {
    pub fn iter(&self) -> std::slice::Iter<'_, SessionSummary> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a SessionListing {
    type Item = &'a SessionSummary;
    type IntoIter = std::slice::Iter<'a, SessionSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for SessionListing {
    type Item = SessionSummary;
    type IntoIter = std::vec::IntoIter<SessionSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Aggregate counters returned by `SessionManager::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub checkpoints: usize,
    pub disk_usage_bytes: u64,
}

/// What a garbage-collection pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub expired_sessions: Vec<String>,
    pub orphaned_workspaces: Vec<PathBuf>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.expired_sessions.is_empty() && self.orphaned_workspaces.is_empty()
    }
}
