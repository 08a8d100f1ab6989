//! Backend and state manager interfaces.
//!
//! A backend names workspaces and hands out a [`StateManager`] per
//! workspace. Locks are advisory and backend-scoped: exactly one holder per
//! workspace, conflicts carry the holder's [`LockInfo`], and stale locks
//! require an explicit force-unlock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::State;

pub const DEFAULT_WORKSPACE: &str = "default";

/// Who holds (or wants) a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Content-addressable unique id for this acquisition.
    pub id: String,
    pub who: String,
    pub operation: String,
    pub created: DateTime<Utc>,
    pub version: String,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>) -> LockInfo {
        let who = format!(
            "{}@{}",
            std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            hostname()
        );
        LockInfo {
            id: uuid::Uuid::new_v4().to_string(),
            who,
            operation: operation.into(),
            created: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (operation {:?}, created {}, id {})",
            self.who, self.operation, self.created, self.id
        )
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("workspace is locked by {info}")]
    LockConflict { info: LockInfo },
    #[error("lock id mismatch: lock is held with id {held}, unlock attempted with {given}")]
    LockMismatch { held: String, given: String },
    #[error("workspace is not locked")]
    NotLocked,
    #[error("state lineage mismatch: writing {expected}, found {actual}")]
    LineageMismatch { expected: String, actual: String },
    #[error("state serial regression: persisted serial {persisted}, writing {writing}")]
    SerialRegression { persisted: u64, writing: u64 },
    #[error("corrupt state payload: {0}")]
    Corrupt(String),
    #[error("workspace {0:?} does not exist")]
    NoSuchWorkspace(String),
    #[error("workspace {0:?} is not empty")]
    WorkspaceNotEmpty(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Manages the state of one workspace.
#[async_trait]
pub trait StateManager: Send {
    /// Acquires the workspace lock, returning the lock id to pass to
    /// [`StateManager::unlock`].
    async fn lock(&mut self, info: &LockInfo) -> Result<String, StateError>;

    /// Releases the lock; the id must match the one returned by `lock`.
    async fn unlock(&mut self, lock_id: &str) -> Result<(), StateError>;

    /// Reloads the persisted snapshot into memory.
    async fn refresh_state(&mut self) -> Result<(), StateError>;

    /// The current in-memory snapshot, if any state exists.
    fn state(&self) -> Option<State>;

    /// Replaces the in-memory snapshot. Does not persist.
    fn write_state(&mut self, state: State) -> Result<(), StateError>;

    /// Persists the in-memory snapshot, incrementing its serial.
    async fn persist_state(&mut self) -> Result<(), StateError>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn state_mgr(&self, workspace: &str) -> Result<Box<dyn StateManager>, StateError>;

    async fn workspaces(&self) -> Result<Vec<String>, StateError>;

    async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError>;

    /// Removes a stale lock without holding its id. Destructive; requires
    /// the id recorded in the lock for confirmation.
    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError>;
}

/// Acquires a lock, retrying with exponential backoff until `timeout`.
///
/// Zero timeout means a single attempt. Only lock conflicts are retried;
/// any other error aborts immediately.
pub async fn lock_with_timeout(
    mgr: &mut dyn StateManager,
    info: &LockInfo,
    timeout: std::time::Duration,
) -> Result<String, StateError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = std::time::Duration::from_millis(250);
    loop {
        match mgr.lock(info).await {
            Ok(id) => return Ok(id),
            Err(StateError::LockConflict { info: holder }) => {
                if tokio::time::Instant::now() + delay > deadline {
                    return Err(StateError::LockConflict { info: holder });
                }
                tracing::info!(holder = %holder, "waiting for state lock");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, std::time::Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
}
