//! Per-session execution locks: at most one pipeline run per session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use berth_types::{BerthError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

/// What a run does when its session is already running another pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Queue behind the running pipeline.
    #[default]
    Wait,
    /// Fail immediately with `Busy`.
    FailFast,
}

/// Held for the duration of a run.
pub type SessionGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str, policy: ContentionPolicy) -> Result<SessionGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|id, l| id == session_id || Arc::strong_count(l) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };

        match policy {
            ContentionPolicy::Wait => {
                if let Ok(guard) = lock.clone().try_lock_owned() {
                    return Ok(guard);
                }
                tracing::debug!(session_id, "Waiting for session lock");
                Ok(lock.lock_owned().await)
            }
            ContentionPolicy::FailFast => lock.try_lock_owned().map_err(|_| BerthError::Busy {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Whether a run currently holds the session.
    pub fn is_locked(&self, session_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(session_id)
            .is_some_and(|l| l.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn fail_fast_reports_busy() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("s1", ContentionPolicy::FailFast).await.unwrap();
        assert!(locks.is_locked("s1"));

        let err = locks.acquire("s1", ContentionPolicy::FailFast).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        // Other sessions are independent.
        assert!(locks.acquire("s2", ContentionPolicy::FailFast).await.is_ok());

        drop(guard);
        assert!(!locks.is_locked("s1"));
        assert!(locks.acquire("s1", ContentionPolicy::FailFast).await.is_ok());
    }

    #[tokio::test]
    async fn wait_queues_behind_holder() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1", ContentionPolicy::Wait).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("s1", ContentionPolicy::Wait).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}
