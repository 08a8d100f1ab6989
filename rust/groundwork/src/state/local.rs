//! Local filesystem backend.
//!
//! Workspace `W` lives at `<root>/W.gwstate` with its lock at
//! `<root>/W.gwlock`. Locking uses create-new semantics on the lock file,
//! which is atomic on all supported filesystems.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::backend::{Backend, LockInfo, StateError, StateManager};
use super::{check_can_supersede, decode_state, encode_state, State};
use crate::encryption::EncryptionHook;

pub struct LocalBackend {
    root: PathBuf,
    encryption: Arc<dyn EncryptionHook>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, encryption: Arc<dyn EncryptionHook>) -> LocalBackend {
        LocalBackend {
            root: root.into(),
            encryption,
        }
    }

    fn state_path(&self, workspace: &str) -> PathBuf {
        self.root.join(format!("{}.gwstate", workspace))
    }

    fn lock_path(&self, workspace: &str) -> PathBuf {
        self.root.join(format!("{}.gwlock", workspace))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn state_mgr(&self, workspace: &str) -> Result<Box<dyn StateManager>, StateError> {
        std::fs::create_dir_all(&self.root)?;
        let mut mgr = LocalStateManager {
            state_path: self.state_path(workspace),
            lock_path: self.lock_path(workspace),
            encryption: self.encryption.clone(),
            snapshot: None,
            persisted_serial: None,
        };
        mgr.refresh_state().await?;
        Ok(Box::new(mgr))
    }

    async fn workspaces(&self) -> Result<Vec<String>, StateError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".gwstate"))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError> {
        let path = self.state_path(name);
        if !path.exists() {
            return Err(StateError::NoSuchWorkspace(name.to_string()));
        }
        if !force {
            let bytes = std::fs::read(&path)?;
            let state = decode_state(&bytes, self.encryption.as_ref())?;
            if !state.is_empty() {
                return Err(StateError::WorkspaceNotEmpty(name.to_string()));
            }
        }
        std::fs::remove_file(&path)?;
        let _ = std::fs::remove_file(self.lock_path(name));
        Ok(())
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError> {
        let lock_path = self.lock_path(workspace);
        let held = read_lock_info(&lock_path)?.ok_or(StateError::NotLocked)?;
        if held.id != lock_id {
            return Err(StateError::LockMismatch {
                held: held.id,
                given: lock_id.to_string(),
            });
        }
        std::fs::remove_file(&lock_path)?;
        Ok(())
    }
}

fn read_lock_info(path: &PathBuf) -> Result<Option<LockInfo>, StateError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let info: LockInfo = serde_json::from_slice(&bytes)
                .map_err(|e| StateError::Corrupt(format!("lock file: {}", e)))?;
            Ok(Some(info))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct LocalStateManager {
    state_path: PathBuf,
    lock_path: PathBuf,
    encryption: Arc<dyn EncryptionHook>,
    snapshot: Option<State>,
    /// Serial of the persisted copy the snapshot derives from; the basis
    /// for the optimistic-concurrency check on persist.
    persisted_serial: Option<u64>,
}

#[async_trait]
impl StateManager for LocalStateManager {
    async fn lock(&mut self, info: &LockInfo) -> Result<String, StateError> {
        let result = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path);
        match result {
            Ok(mut f) => {
                let payload = serde_json::to_vec_pretty(info)
                    .map_err(|e| StateError::Backend(e.to_string()))?;
                f.write_all(&payload)?;
                Ok(info.id.clone())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_lock_info(&self.lock_path)?.ok_or(StateError::NotLocked)?;
                Err(StateError::LockConflict { info: holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&mut self, lock_id: &str) -> Result<(), StateError> {
        let held = read_lock_info(&self.lock_path)?.ok_or(StateError::NotLocked)?;
        if held.id != lock_id {
            return Err(StateError::LockMismatch {
                held: held.id,
                given: lock_id.to_string(),
            });
        }
        std::fs::remove_file(&self.lock_path)?;
        Ok(())
    }

    async fn refresh_state(&mut self) -> Result<(), StateError> {
        match std::fs::read(&self.state_path) {
            Ok(bytes) => {
                let state = decode_state(&bytes, self.encryption.as_ref())?;
                self.persisted_serial = Some(state.serial);
                self.snapshot = Some(state);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.snapshot = None;
                self.persisted_serial = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn state(&self) -> Option<State> {
        self.snapshot.clone()
    }

    fn write_state(&mut self, state: State) -> Result<(), StateError> {
        if let Some(current) = &self.snapshot {
            if current.lineage != state.lineage {
                return Err(StateError::LineageMismatch {
                    expected: state.lineage,
                    actual: current.lineage.clone(),
                });
            }
        }
        self.snapshot = Some(state);
        Ok(())
    }

    async fn persist_state(&mut self) -> Result<(), StateError> {
        let mut state = match &self.snapshot {
            Some(s) => s.clone(),
            None => return Ok(()),
        };

        // Re-read the persisted copy for optimistic concurrency: a peer
        // that persisted past our base serial must not be clobbered.
        let persisted = match std::fs::read(&self.state_path) {
            Ok(bytes) => Some(decode_state(&bytes, self.encryption.as_ref())?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        check_can_supersede(persisted.as_ref(), &state, self.persisted_serial)?;
        state.serial = persisted.as_ref().map(|p| p.serial + 1).unwrap_or(1);

        let bytes = encode_state(&state, self.encryption.as_ref())?;
        let tmp = self.state_path.with_extension("gwstate.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.state_path)?;

        self.persisted_serial = Some(state.serial);
        self.snapshot = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_instance;
    use super::*;
    use crate::encryption::{AeadEncryption, Disabled, Passphrase};
    use crate::state::backend::lock_with_timeout;

    fn local_backend(dir: &std::path::Path) -> LocalBackend {
        LocalBackend::new(dir, Arc::new(Disabled))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut mgr = backend.state_mgr("default").await.unwrap();

        assert!(mgr.state().is_none());
        let mut state = State::new();
        state.put(sample_instance("a"));
        mgr.write_state(state.clone()).unwrap();
        mgr.persist_state().await.unwrap();

        let mut mgr2 = backend.state_mgr("default").await.unwrap();
        mgr2.refresh_state().await.unwrap();
        let read = mgr2.state().unwrap();
        assert_eq!(read.lineage, state.lineage);
        assert_eq!(read.serial, 1);
        assert_eq!(read.resources, state.resources);
    }

    #[tokio::test]
    async fn serial_increments_on_each_persist() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut mgr = backend.state_mgr("default").await.unwrap();
        mgr.write_state(State::new()).unwrap();
        mgr.persist_state().await.unwrap();
        assert_eq!(mgr.state().unwrap().serial, 1);
        mgr.persist_state().await.unwrap();
        assert_eq!(mgr.state().unwrap().serial, 2);
    }

    #[tokio::test]
    async fn concurrent_writer_serial_regression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());

        let mut a = backend.state_mgr("default").await.unwrap();
        a.write_state(State::new()).unwrap();
        a.persist_state().await.unwrap(); // serial 1

        // B reads at serial 1; A persists again behind B's back.
        let mut b = backend.state_mgr("default").await.unwrap();
        let seen_by_b = b.state().unwrap();
        assert_eq!(seen_by_b.serial, 1);
        a.persist_state().await.unwrap(); // serial 2

        let mut stale = seen_by_b;
        stale.put(sample_instance("a"));
        b.write_state(stale).unwrap();
        assert!(matches!(
            b.persist_state().await,
            Err(StateError::SerialRegression {
                persisted: 2,
                writing: 1
            })
        ));

        // After re-reading the newer copy, B may persist.
        b.refresh_state().await.unwrap();
        let mut fresh = b.state().unwrap();
        fresh.put(sample_instance("a"));
        b.write_state(fresh).unwrap();
        b.persist_state().await.unwrap();
        assert_eq!(b.state().unwrap().serial, 3);
    }

    #[tokio::test]
    async fn exactly_one_of_two_lockers_wins() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut a = backend.state_mgr("default").await.unwrap();
        let mut b = backend.state_mgr("default").await.unwrap();

        let info_a = LockInfo::new("plan");
        let info_b = LockInfo::new("apply");
        let id = a.lock(&info_a).await.unwrap();

        match b.lock(&info_b).await {
            Err(StateError::LockConflict { info }) => {
                assert_eq!(info.id, info_a.id);
                assert_eq!(info.operation, "plan");
            }
            other => panic!("expected lock conflict, got {:?}", other.map(|_| ())),
        }

        a.unlock(&id).await.unwrap();
        let id_b = b.lock(&info_b).await.unwrap();
        b.unlock(&id_b).await.unwrap();
    }

    #[tokio::test]
    async fn unlock_verifies_id() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut mgr = backend.state_mgr("default").await.unwrap();
        mgr.lock(&LockInfo::new("plan")).await.unwrap();
        assert!(matches!(
            mgr.unlock("wrong-id").await,
            Err(StateError::LockMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn force_unlock_removes_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut mgr = backend.state_mgr("default").await.unwrap();
        let info = LockInfo::new("apply");
        let id = mgr.lock(&info).await.unwrap();
        drop(mgr); // holder went away without unlocking

        assert!(matches!(
            backend.force_unlock("default", "nope").await,
            Err(StateError::LockMismatch { .. })
        ));
        backend.force_unlock("default", &id).await.unwrap();

        let mut mgr = backend.state_mgr("default").await.unwrap();
        mgr.lock(&LockInfo::new("plan")).await.unwrap();
    }

    #[tokio::test]
    async fn lock_with_timeout_retries_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());
        let mut a = backend.state_mgr("default").await.unwrap();
        let id = a.lock(&LockInfo::new("plan")).await.unwrap();

        let mut b = backend.state_mgr("default").await.unwrap();
        let lock_path = dir.path().join("default.gwlock");
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            std::fs::remove_file(lock_path).unwrap();
            id
        });

        let info = LockInfo::new("apply");
        let got = lock_with_timeout(
            b.as_mut(),
            &info,
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(got, info.id);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn workspaces_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = local_backend(dir.path());

        let mut mgr = backend.state_mgr("staging").await.unwrap();
        mgr.write_state(State::new()).unwrap();
        mgr.persist_state().await.unwrap();

        let mut mgr = backend.state_mgr("prod").await.unwrap();
        let mut state = State::new();
        state.put(sample_instance("a"));
        mgr.write_state(state).unwrap();
        mgr.persist_state().await.unwrap();

        assert_eq!(
            backend.workspaces().await.unwrap(),
            vec!["prod".to_string(), "staging".to_string()]
        );

        // Empty workspace deletes cleanly; non-empty needs force.
        backend.delete_workspace("staging", false).await.unwrap();
        assert!(matches!(
            backend.delete_workspace("prod", false).await,
            Err(StateError::WorkspaceNotEmpty(_))
        ));
        backend.delete_workspace("prod", true).await.unwrap();
        assert!(backend.workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn encrypted_state_round_trips_and_fails_with_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(
            dir.path(),
            Arc::new(AeadEncryption::new(Passphrase::new("k1"))),
        );
        let mut mgr = backend.state_mgr("default").await.unwrap();
        let mut state = State::new();
        state.put(sample_instance("a"));
        mgr.write_state(state.clone()).unwrap();
        mgr.persist_state().await.unwrap();

        let reread = backend.state_mgr("default").await.unwrap();
        assert_eq!(reread.state().unwrap().resources, state.resources);

        let wrong = LocalBackend::new(
            dir.path(),
            Arc::new(AeadEncryption::new(Passphrase::new("k2"))),
        );
        assert!(wrong.state_mgr("default").await.is_err());
    }
}
