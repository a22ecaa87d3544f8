//! Session lifecycle: creation, isolated workspaces, checkpoints, expiry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use berth_types::{BerthError, CancellationToken, Labels, Result};
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::session::{
    Checkpoint, GcReport, Session, SessionConfig, SessionFilter, SessionListing, SessionState,
    SessionStats, SessionUpdate,
};
use crate::snapshot;
use crate::store::SessionStore;

/// Directory under the workspace root that holds checkpoint snapshots.
pub const CHECKPOINT_DIR: &str = ".checkpoints";

/// Limits and locations for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub workspace_root: PathBuf,
    pub max_sessions: usize,
    pub default_ttl: Option<Duration>,
    pub disk_quota_bytes: Option<u64>,
}

impl SessionManagerConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_sessions: 100,
            default_ttl: None,
            disk_quota_bytes: None,
        }
    }
}

/// Owns every session record and workspace under one root directory.
///
/// The session table sits behind a reader/writer lock that is never held
/// across an `.await`; filesystem work runs on the blocking pool. Writes to
/// one session reach the store in the order they were applied in memory.
pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: RwLock<HashMap<String, Session>>,
    /// Per-session guard held from an in-memory change until it is persisted.
    writes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: Arc<dyn SessionStore>,
    cleanup: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BerthError::Other(format!("blocking task failed: {e}")))?
}

impl SessionManager {
    /// Open the manager, creating the workspace root and reloading every
    /// persisted session whose workspace still exists.
    pub async fn open(config: SessionManagerConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.workspace_root).await?;
        tokio::fs::create_dir_all(config.workspace_root.join(CHECKPOINT_DIR)).await?;

        let mut sessions = HashMap::new();
        for session in store.load_all().await? {
            if !session.workspace.is_dir() {
                tracing::warn!(session_id = %session.id, "Dropping persisted session without a workspace");
                store.remove(&session.id).await?;
                continue;
            }
            sessions.insert(session.id.clone(), session);
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Reloaded persisted sessions");
        }

        Ok(Self {
            config,
            sessions: RwLock::new(sessions),
            writes: Mutex::new(HashMap::new()),
            store,
            cleanup: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.config.workspace_root
    }

    fn checkpoint_root(&self, session_id: &str) -> PathBuf {
        self.config
            .workspace_root
            .join(CHECKPOINT_DIR)
            .join(session_id)
    }

    fn snapshot_dir(&self, session_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_root(session_id).join(checkpoint_id)
    }

    fn read_session(&self, id: &str) -> Result<Session> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| BerthError::not_found("session", id))
    }

    fn write_guard(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Apply `f` to the stored record and persist the result. Concurrent
    /// mutations of one session are serialized through `save`.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        if !self.exists(id) {
            return Err(BerthError::not_found("session", id));
        }
        let guard = self.write_guard(id);
        let _serialized = guard.lock().await;
        let updated = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| BerthError::not_found("session", id))?;
            f(session)?;
            session.touch();
            session.clone()
        };
        self.store.save(&updated).await?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a session with a fresh, empty workspace.
    pub async fn create(&self, config: SessionConfig) -> Result<Session> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let workspace = self.config.workspace_root.join(&id);
        let now = Utc::now();
        let ttl = config
            .ttl
            .or(self.config.default_ttl)
            .filter(|t| !t.is_zero());

        let session = Session {
            id: id.clone(),
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            expires_at: ttl.map(|t| now + chrono::Duration::seconds(t.as_secs() as i64)),
            ttl_secs: ttl.map(|t| t.as_secs()),
            labels: config.labels,
            metadata: config.metadata,
            workspace: workspace.clone(),
            checkpoints: Vec::new(),
            last_completed_stage: None,
        };

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if sessions.len() >= self.config.max_sessions {
                return Err(BerthError::ResourceExhausted(format!(
                    "maximum of {} concurrent sessions reached",
                    self.config.max_sessions
                )));
            }
            sessions.insert(id.clone(), session.clone());
        }

        let persisted = async {
            tokio::fs::create_dir(&workspace).await?;
            self.store.save(&session).await
        }
        .await;
        if let Err(e) = persisted {
            self.sessions
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            let _ = tokio::fs::remove_dir_all(&workspace).await;
            return Err(e);
        }

        tracing::info!(session_id = %id, workspace = %workspace.display(), "Session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Session> {
        self.read_session(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Apply a partial update. Never touches the workspace.
    pub async fn update(&self, id: &str, update: SessionUpdate) -> Result<Session> {
        if update.state == Some(SessionState::Deleted) {
            return Err(BerthError::validation(
                "session",
                "use delete to remove a session",
            ));
        }
        self.mutate(id, move |session| {
            if let Some(state) = update.state {
                session.state = state;
            }
            for key in &update.remove_labels {
                session.labels.remove(key);
            }
            session.labels.extend(update.set_labels);
            session.metadata.extend(update.metadata);
            if let Some(stage) = update.last_completed_stage {
                session.last_completed_stage = Some(stage);
            }
            Ok(())
        })
        .await
    }

    /// Remove the record, its checkpoints and its workspace.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let guard = self.write_guard(id);
        let _serialized = guard.lock().await;
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| BerthError::not_found("session", id))?;

        self.store.remove(id).await?;
        remove_dir_if_exists(&removed.workspace).await?;
        remove_dir_if_exists(&self.checkpoint_root(id)).await?;
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        tracing::info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Summaries of matching sessions, oldest first.
    pub fn list(&self, filter: &SessionFilter) -> SessionListing {
        let mut items: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| filter.matches(s))
            .map(Session::summary)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        SessionListing { items }
    }

    // -----------------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------------

    pub async fn add_label(&self, id: &str, key: &str, value: &str) -> Result<Session> {
        let (key, value) = (key.to_string(), value.to_string());
        self.mutate(id, move |s| {
            s.labels.insert(key, value);
            Ok(())
        })
        .await
    }

    pub async fn remove_label(&self, id: &str, key: &str) -> Result<Session> {
        self.mutate(id, |s| {
            s.labels.remove(key);
            Ok(())
        })
        .await
    }

    pub fn labels(&self, id: &str) -> Result<Labels> {
        self.read_session(id).map(|s| s.labels)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Snapshot the workspace and append a checkpoint record.
    pub async fn checkpoint(&self, id: &str, note: Option<String>) -> Result<Checkpoint> {
        let session = self.read_session(id)?;
        let checkpoint_id = uuid::Uuid::new_v4().simple().to_string();
        let snapshot_dir = self.snapshot_dir(id, &checkpoint_id);

        let workspace = session.workspace.clone();
        let target = snapshot_dir.clone();
        let digest = blocking(move || {
            snapshot::copy_tree(&workspace, &target)?;
            snapshot::digest_tree(&target)
        })
        .await;
        let digest = match digest {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&snapshot_dir).await;
                return Err(e);
            }
        };

        let checkpoint = Checkpoint {
            id: checkpoint_id,
            session_id: id.to_string(),
            created_at: Utc::now(),
            fingerprint: digest.fingerprint,
            file_count: digest.file_count,
            byte_size: digest.byte_size,
            note,
        };

        let record = checkpoint.clone();
        let saved = self
            .mutate(id, move |s| {
                s.checkpoints.push(record);
                s.state = SessionState::Checkpointed;
                Ok(())
            })
            .await;
        if let Err(e) = saved {
            // The session vanished while the snapshot was copied.
            let _ = tokio::fs::remove_dir_all(&snapshot_dir).await;
            return Err(e);
        }

        tracing::info!(
            session_id = %id,
            checkpoint_id = %checkpoint.id,
            files = checkpoint.file_count,
            bytes = checkpoint.byte_size,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Make the workspace byte-identical to the checkpoint.
    pub async fn restore(&self, id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let session = self.read_session(id)?;
        let checkpoint = session
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
            .ok_or_else(|| BerthError::not_found("checkpoint", checkpoint_id))?;

        let snapshot_dir = self.snapshot_dir(id, checkpoint_id);
        if !snapshot_dir.is_dir() {
            return Err(BerthError::execution(
                "restore",
                format!("snapshot for checkpoint '{checkpoint_id}' is missing on disk"),
            ));
        }

        let workspace = session.workspace.clone();
        let restored = blocking(move || {
            snapshot::restore_tree(&snapshot_dir, &workspace)?;
            snapshot::digest_tree(&workspace)
        })
        .await?;
        if restored.fingerprint != checkpoint.fingerprint {
            tracing::error!(
                session_id = %id,
                checkpoint_id,
                expected = %checkpoint.fingerprint,
                actual = %restored.fingerprint,
                "Restored workspace does not match checkpoint"
            );
            return Err(BerthError::execution(
                "restore",
                "restored workspace does not match the checkpoint fingerprint",
            ));
        }

        self.mutate(id, |_| Ok(())).await?;
        tracing::info!(session_id = %id, checkpoint_id, "Workspace restored");
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>> {
        self.read_session(id).map(|s| s.checkpoints)
    }

    pub fn latest_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.read_session(id).map(|s| s.checkpoints.last().cloned())
    }

    pub async fn delete_checkpoint(&self, id: &str, checkpoint_id: &str) -> Result<()> {
        let cid = checkpoint_id.to_string();
        self.mutate(id, move |s| {
            let before = s.checkpoints.len();
            s.checkpoints.retain(|c| c.id != cid);
            if s.checkpoints.len() == before {
                return Err(BerthError::not_found("checkpoint", cid));
            }
            Ok(())
        })
        .await?;
        remove_dir_if_exists(&self.snapshot_dir(id, checkpoint_id)).await
    }

    // -----------------------------------------------------------------------
    // Disk usage
    // -----------------------------------------------------------------------

    pub async fn disk_usage(&self, id: &str) -> Result<u64> {
        let workspace = self.read_session(id)?.workspace;
        blocking(move || Ok(snapshot::tree_size(&workspace))).await
    }

    /// Fail with `ResourceExhausted` if writing `additional_bytes` more would
    /// exceed the per-session quota.
    pub async fn check_disk_quota(&self, id: &str, additional_bytes: u64) -> Result<()> {
        let Some(quota) = self.config.disk_quota_bytes else {
            self.read_session(id)?;
            return Ok(());
        };
        let used = self.disk_usage(id).await?;
        if used.saturating_add(additional_bytes) > quota {
            return Err(BerthError::ResourceExhausted(format!(
                "session '{id}' would use {} bytes, quota is {quota}",
                used.saturating_add(additional_bytes)
            )));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let sessions: Vec<Session> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut stats = SessionStats {
            total: sessions.len(),
            ..Default::default()
        };
        let mut workspaces = Vec::with_capacity(sessions.len());
        for s in sessions {
            *stats.by_state.entry(s.state.to_string()).or_default() += 1;
            stats.checkpoints += s.checkpoints.len();
            workspaces.push(s.workspace);
        }
        stats.disk_usage_bytes =
            blocking(move || Ok(workspaces.iter().map(|w| snapshot::tree_size(w)).sum())).await?;
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Delete expired sessions and workspace directories that have no record.
    pub async fn garbage_collect(&self) -> Result<GcReport> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();

        let mut report = GcReport::default();
        for id in expired {
            match self.delete(&id).await {
                Ok(()) => report.expired_sessions.push(id),
                // Deleted concurrently
                Err(e) if e.kind() == berth_types::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let mut entries = tokio::fs::read_dir(&self.config.workspace_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CHECKPOINT_DIR || !entry.file_type().await?.is_dir() || self.exists(&name) {
                continue;
            }
            tokio::fs::remove_dir_all(entry.path()).await?;
            remove_dir_if_exists(&self.checkpoint_root(&name)).await?;
            report.orphaned_workspaces.push(entry.path());
        }

        if !report.is_empty() {
            tracing::info!(
                expired = report.expired_sessions.len(),
                orphaned = report.orphaned_workspaces.len(),
                "Garbage collection removed sessions"
            );
        }
        Ok(report)
    }

    /// Run `garbage_collect` every `interval` until [`stop_cleanup`] is called.
    /// Calling it again replaces the running task.
    ///
    /// [`stop_cleanup`]: SessionManager::stop_cleanup
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        let manager = Arc::downgrade(self);
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.garbage_collect().await {
                    tracing::warn!(error = %e, "Session cleanup failed");
                }
            }
        });

        let previous = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((token, handle));
        if let Some((old, _)) = previous {
            old.cancel();
        }
    }

    pub async fn stop_cleanup(&self) {
        let running = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((token, handle)) = running {
            token.cancel();
            let _ = handle.await;
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, SqliteSessionStore};
    use berth_types::ErrorKind;

    async fn manager(root: &Path) -> SessionManager {
        SessionManager::open(
            SessionManagerConfig::new(root),
            Arc::new(MemorySessionStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_gives_each_session_its_own_empty_workspace() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;

        let a = mgr.create(SessionConfig::default()).await.unwrap();
        let b = mgr.create(SessionConfig::default()).await.unwrap();
        assert_ne!(a.workspace, b.workspace);
        assert_eq!(a.workspace, root.path().join(&a.id));
        assert!(a.workspace.is_dir());
        assert_eq!(std::fs::read_dir(&a.workspace).unwrap().count(), 0);
        assert_eq!(a.state, SessionState::Created);
    }

    #[tokio::test]
    async fn create_respects_session_limit() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SessionManagerConfig::new(root.path());
        config.max_sessions = 1;
        let mgr = SessionManager::open(config, Arc::new(MemorySessionStore::new()))
            .await
            .unwrap();

        mgr.create(SessionConfig::default()).await.unwrap();
        let err = mgr.create(SessionConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn delete_removes_only_that_session() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let a = mgr.create(SessionConfig::default()).await.unwrap();
        let b = mgr.create(SessionConfig::default()).await.unwrap();
        std::fs::write(b.workspace.join("keep.txt"), "b").unwrap();
        mgr.checkpoint(&a.id, None).await.unwrap();

        mgr.delete(&a.id).await.unwrap();
        assert_eq!(mgr.get(&a.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(!a.workspace.exists());
        assert!(!root.path().join(CHECKPOINT_DIR).join(&a.id).exists());

        assert!(mgr.get(&b.id).is_ok());
        assert_eq!(std::fs::read_to_string(b.workspace.join("keep.txt")).unwrap(), "b");
        assert_eq!(mgr.delete(&a.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn checkpoint_mutate_restore_is_byte_identical() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let s = mgr.create(SessionConfig::default()).await.unwrap();
        std::fs::write(s.workspace.join("Dockerfile"), "FROM node:20\n").unwrap();

        let cp = mgr.checkpoint(&s.id, Some("before build".into())).await.unwrap();
        assert_eq!(cp.file_count, 1);
        assert_eq!(mgr.get(&s.id).unwrap().state, SessionState::Checkpointed);

        std::fs::write(s.workspace.join("Dockerfile"), "FROM broken\n").unwrap();
        std::fs::write(s.workspace.join("a.txt"), "new").unwrap();

        mgr.restore(&s.id, &cp.id).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(s.workspace.join("Dockerfile")).unwrap(),
            "FROM node:20\n"
        );
        assert!(!s.workspace.join("a.txt").exists());
    }

    #[tokio::test]
    async fn restore_of_empty_checkpoint_removes_new_file() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let s = mgr.create(SessionConfig::default()).await.unwrap();

        let cp = mgr.checkpoint(&s.id, None).await.unwrap();
        std::fs::write(s.workspace.join("a.txt"), "x").unwrap();
        mgr.restore(&s.id, &cp.id).await.unwrap();
        assert!(!s.workspace.join("a.txt").exists());
    }

    #[tokio::test]
    async fn restore_unknown_checkpoint_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let s = mgr.create(SessionConfig::default()).await.unwrap();
        let err = mgr.restore(&s.id, "missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn checkpoint_listing_and_deletion() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let s = mgr.create(SessionConfig::default()).await.unwrap();

        let first = mgr.checkpoint(&s.id, Some("one".into())).await.unwrap();
        let second = mgr.checkpoint(&s.id, Some("two".into())).await.unwrap();
        assert_eq!(mgr.list_checkpoints(&s.id).unwrap().len(), 2);
        assert_eq!(mgr.latest_checkpoint(&s.id).unwrap().unwrap().id, second.id);

        mgr.delete_checkpoint(&s.id, &second.id).await.unwrap();
        assert_eq!(mgr.latest_checkpoint(&s.id).unwrap().unwrap().id, first.id);
        assert!(!root
            .path()
            .join(CHECKPOINT_DIR)
            .join(&s.id)
            .join(&second.id)
            .exists());
        assert_eq!(
            mgr.delete_checkpoint(&s.id, &second.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn update_and_labels() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let s = mgr
            .create(SessionConfig::default().with_label("team", "web"))
            .await
            .unwrap();

        mgr.add_label(&s.id, "env", "dev").await.unwrap();
        mgr.remove_label(&s.id, "team").await.unwrap();
        let labels = mgr.labels(&s.id).unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["env"], "dev");

        let mut update = SessionUpdate::state(SessionState::Active);
        update.last_completed_stage = Some("build".into());
        let updated = mgr.update(&s.id, update).await.unwrap();
        assert_eq!(updated.state, SessionState::Active);
        assert_eq!(updated.summary().last_completed_stage.as_deref(), Some("build"));

        let err = mgr
            .update("gone", SessionUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_state() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let a = mgr
            .create(SessionConfig::default().with_label("team", "web"))
            .await
            .unwrap();
        mgr.create(SessionConfig::default().with_label("team", "data"))
            .await
            .unwrap();
        mgr.update(&a.id, SessionUpdate::state(SessionState::Active))
            .await
            .unwrap();

        assert_eq!(mgr.list(&SessionFilter::default()).len(), 2);
        let web = mgr.list(&SessionFilter::default().with_label("team", "web"));
        assert_eq!(web.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec![a.id.as_str()]);
        let active = mgr.list(&SessionFilter::default().with_state(SessionState::Active));
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn disk_quota_is_enforced() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SessionManagerConfig::new(root.path());
        config.disk_quota_bytes = Some(10);
        let mgr = SessionManager::open(config, Arc::new(MemorySessionStore::new()))
            .await
            .unwrap();
        let s = mgr.create(SessionConfig::default()).await.unwrap();
        std::fs::write(s.workspace.join("f"), "12345678").unwrap();

        assert_eq!(mgr.disk_usage(&s.id).await.unwrap(), 8);
        assert!(mgr.check_disk_quota(&s.id, 2).await.is_ok());
        let err = mgr.check_disk_quota(&s.id, 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn stats_count_states_and_checkpoints() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let a = mgr.create(SessionConfig::default()).await.unwrap();
        mgr.create(SessionConfig::default()).await.unwrap();
        std::fs::write(a.workspace.join("f"), "abc").unwrap();
        mgr.checkpoint(&a.id, None).await.unwrap();

        let stats = mgr.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.by_state["created"], 1);
        assert_eq!(stats.by_state["checkpointed"], 1);
        assert_eq!(stats.disk_usage_bytes, 3);
    }

    #[tokio::test]
    async fn gc_removes_expired_and_orphaned() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager(root.path()).await;
        let expired = mgr
            .create(SessionConfig::default().with_ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        let live = mgr.create(SessionConfig::default()).await.unwrap();
        std::fs::create_dir(root.path().join("stray")).unwrap();

        // Force expiry without sleeping
        mgr.sessions
            .write()
            .unwrap()
            .get_mut(&expired.id)
            .unwrap()
            .expires_at = Some(Utc::now() - chrono::Duration::seconds(5));

        let report = mgr.garbage_collect().await.unwrap();
        assert_eq!(report.expired_sessions, vec![expired.id.clone()]);
        assert_eq!(report.orphaned_workspaces, vec![root.path().join("stray")]);
        assert!(mgr.get(&live.id).is_ok());
        assert!(root.path().join(CHECKPOINT_DIR).is_dir());
    }

    #[tokio::test]
    async fn cleanup_task_starts_and_stops() {
        let root = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(root.path()).await);
        std::fs::create_dir(root.path().join("stray")).unwrap();

        mgr.start_cleanup(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        mgr.stop_cleanup().await;
        assert!(!root.path().join("stray").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_label_writes_all_persist() {
        let root = tempfile::tempdir().unwrap();
        let db = root.path().join("sessions.db");
        let ws_root = root.path().join("workspaces");

        let id = {
            let store = Arc::new(SqliteSessionStore::open(&db).await.unwrap());
            let mgr = Arc::new(
                SessionManager::open(SessionManagerConfig::new(&ws_root), store)
                    .await
                    .unwrap(),
            );
            let id = mgr.create(SessionConfig::default()).await.unwrap().id;

            let writers: Vec<_> = (0..32)
                .map(|n| {
                    let mgr = mgr.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        mgr.add_label(&id, &format!("k{n}"), "v").await.unwrap();
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }
            assert_eq!(mgr.labels(&id).unwrap().len(), 32);
            id
        };

        let store = Arc::new(SqliteSessionStore::open(&db).await.unwrap());
        let mgr = SessionManager::open(SessionManagerConfig::new(&ws_root), store)
            .await
            .unwrap();
        assert_eq!(mgr.get(&id).unwrap().labels.len(), 32);
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let root = tempfile::tempdir().unwrap();
        let db = root.path().join("state/sessions.db");
        let ws_root = root.path().join("workspaces");

        let id = {
            let store = Arc::new(SqliteSessionStore::open(&db).await.unwrap());
            let mgr = SessionManager::open(SessionManagerConfig::new(&ws_root), store)
                .await
                .unwrap();
            let s = mgr
                .create(SessionConfig::default().with_label("team", "web"))
                .await
                .unwrap();
            mgr.checkpoint(&s.id, None).await.unwrap();
            s.id
        };

        let store = Arc::new(SqliteSessionStore::open(&db).await.unwrap());
        let mgr = SessionManager::open(SessionManagerConfig::new(&ws_root), store)
            .await
            .unwrap();
        let s = mgr.get(&id).unwrap();
        assert_eq!(s.labels["team"], "web");
        assert_eq!(s.checkpoints.len(), 1);
    }
}
