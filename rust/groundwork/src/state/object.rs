//! Object-store backend.
//!
//! Generic over an [`ObjectStore`]: for prefix `P` and workspace `W` the
//! state object is `P/W.gwstate` and the lock object is `P/W.gwlock`.
//! [`FsObjectStore`] provides a filesystem-rooted store for tests and local
//! mirrors; remote stores (cloud buckets) implement the same five calls.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::backend::{Backend, LockInfo, StateError, StateManager};
use super::{check_can_supersede, decode_state, encode_state, State};
use crate::encryption::EncryptionHook;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StateError>;

    /// Writes only if the object does not exist. Returns false when it does.
    /// This is the primitive the lock protocol depends on; stores must make
    /// it atomic.
    async fn put_if_absent(&self, key: &str, data: Vec<u8>) -> Result<bool, StateError>;

    async fn delete(&self, key: &str) -> Result<(), StateError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StateError>;
}

/// Filesystem-rooted object store.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> FsObjectStore {
        FsObjectStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StateError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Vec<u8>) -> Result<bool, StateError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                use std::io::Write as _;
                f.write_all(&data)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StateError> {
        let dir = self.path_for(prefix);
        let mut keys = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if let Some(name) = entry.file_name().to_str() {
                keys.push(format!("{}/{}", prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Backend persisting state into an object store under a key prefix.
pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    encryption: Arc<dyn EncryptionHook>,
}

impl ObjectBackend {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        encryption: Arc<dyn EncryptionHook>,
    ) -> ObjectBackend {
        ObjectBackend {
            store,
            prefix: prefix.into(),
            encryption,
        }
    }

    fn state_key(&self, workspace: &str) -> String {
        format!("{}/{}.gwstate", self.prefix, workspace)
    }

    fn lock_key(&self, workspace: &str) -> String {
        format!("{}/{}.gwlock", self.prefix, workspace)
    }

    async fn read_lock(&self, workspace: &str) -> Result<Option<LockInfo>, StateError> {
        match self.store.get(&self.lock_key(workspace)).await? {
            Some(bytes) => {
                let info: LockInfo = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Corrupt(format!("lock object: {}", e)))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Backend for ObjectBackend {
    async fn state_mgr(&self, workspace: &str) -> Result<Box<dyn StateManager>, StateError> {
        let mut mgr = ObjectStateManager {
            store: self.store.clone(),
            state_key: self.state_key(workspace),
            lock_key: self.lock_key(workspace),
            encryption: self.encryption.clone(),
            snapshot: None,
            persisted_serial: None,
        };
        mgr.refresh_state().await?;
        Ok(Box::new(mgr))
    }

    async fn workspaces(&self) -> Result<Vec<String>, StateError> {
        let keys = self.store.list(&self.prefix).await?;
        let mut names: Vec<String> = keys
            .into_iter()
            .filter_map(|k| {
                k.rsplit('/')
                    .next()
                    .and_then(|n| n.strip_suffix(".gwstate"))
                    .map(String::from)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_workspace(&self, name: &str, force: bool) -> Result<(), StateError> {
        let key = self.state_key(name);
        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| StateError::NoSuchWorkspace(name.to_string()))?;
        if !force {
            let state = decode_state(&bytes, self.encryption.as_ref())?;
            if !state.is_empty() {
                return Err(StateError::WorkspaceNotEmpty(name.to_string()));
            }
        }
        self.store.delete(&key).await?;
        self.store.delete(&self.lock_key(name)).await?;
        Ok(())
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> Result<(), StateError> {
        let held = self
            .read_lock(workspace)
            .await?
            .ok_or(StateError::NotLocked)?;
        if held.id != lock_id {
            return Err(StateError::LockMismatch {
                held: held.id,
                given: lock_id.to_string(),
            });
        }
        self.store.delete(&self.lock_key(workspace)).await
    }
}

pub struct ObjectStateManager {
    store: Arc<dyn ObjectStore>,
    state_key: String,
    lock_key: String,
    encryption: Arc<dyn EncryptionHook>,
    snapshot: Option<State>,
    /// Serial of the persisted object the snapshot derives from; the basis
    /// for the optimistic-concurrency check on persist.
    persisted_serial: Option<u64>,
}

impl ObjectStateManager {
    async fn read_persisted(&self) -> Result<Option<State>, StateError> {
        match self.store.get(&self.state_key).await? {
            Some(bytes) => Ok(Some(decode_state(&bytes, self.encryption.as_ref())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateManager for ObjectStateManager {
    async fn lock(&mut self, info: &LockInfo) -> Result<String, StateError> {
        let payload = serde_json::to_vec_pretty(info)
            .map_err(|e| StateError::Backend(e.to_string()))?;
        if self.store.put_if_absent(&self.lock_key, payload).await? {
            return Ok(info.id.clone());
        }
        // Lost the race; surface the holder.
        match self.store.get(&self.lock_key).await? {
            Some(bytes) => {
                let holder: LockInfo = serde_json::from_slice(&bytes)
                    .map_err(|e| StateError::Corrupt(format!("lock object: {}", e)))?;
                Err(StateError::LockConflict { info: holder })
            }
            None => Err(StateError::Backend(
                "lock object disappeared during acquisition".to_string(),
            )),
        }
    }

    async fn unlock(&mut self, lock_id: &str) -> Result<(), StateError> {
        let held = match self.store.get(&self.lock_key).await? {
            Some(bytes) => serde_json::from_slice::<LockInfo>(&bytes)
                .map_err(|e| StateError::Corrupt(format!("lock object: {}", e)))?,
            None => return Err(StateError::NotLocked),
        };
        if held.id != lock_id {
            return Err(StateError::LockMismatch {
                held: held.id,
                given: lock_id.to_string(),
            });
        }
        self.store.delete(&self.lock_key).await
    }

    async fn refresh_state(&mut self) -> Result<(), StateError> {
        self.snapshot = self.read_persisted().await?;
        self.persisted_serial = self.snapshot.as_ref().map(|s| s.serial);
        Ok(())
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
        // A peer that persisted past our base serial must not be clobbered.
        let persisted = self.read_persisted().await?;
        check_can_supersede(persisted.as_ref(), &state, self.persisted_serial)?;
        state.serial = persisted.as_ref().map(|p| p.serial + 1).unwrap_or(1);

        let bytes = encode_state(&state, self.encryption.as_ref())?;
        self.store.put(&self.state_key, bytes).await?;
        self.persisted_serial = Some(state.serial);
        self.snapshot = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample_instance;
    use super::*;
    use crate::encryption::Disabled;
    use crate::state::backend::DEFAULT_WORKSPACE;

    fn object_backend(dir: &std::path::Path) -> ObjectBackend {
        ObjectBackend::new(
            Arc::new(FsObjectStore::new(dir)),
            "env/state",
            Arc::new(Disabled),
        )
    }

    #[tokio::test]
    async fn layout_uses_prefix_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = object_backend(dir.path());
        assert_eq!(backend.state_key("default"), "env/state/default.gwstate");
        assert_eq!(backend.lock_key("test"), "env/state/test.gwlock");
    }

    #[tokio::test]
    async fn state_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = object_backend(dir.path());
        let mut mgr = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

        let mut state = State::new();
        state.put(sample_instance("a"));
        mgr.write_state(state.clone()).unwrap();
        mgr.persist_state().await.unwrap();

        let mgr2 = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
        let read = mgr2.state().unwrap();
        assert_eq!(read.resources, state.resources);
        assert_eq!(read.serial, 1);

        assert_eq!(
            backend.workspaces().await.unwrap(),
            vec!["default".to_string()]
        );
    }

    #[tokio::test]
    async fn concurrent_lock_attempts_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let backend = object_backend(dir.path());
        let mut a = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
        let mut b = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();

        let info_a = LockInfo::new("plan");
        let info_b = LockInfo::new("plan");
        let (ra, rb) = tokio::join!(a.lock(&info_a), b.lock(&info_b));

        let winners = [ra.is_ok(), rb.is_ok()];
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
        let loser_err = if ra.is_ok() { rb } else { ra };
        match loser_err {
            Err(StateError::LockConflict { info }) => {
                assert!(info.id == info_a.id || info.id == info_b.id);
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn serial_regression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = object_backend(dir.path());

        let mut a = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
        a.write_state(State::new()).unwrap();
        a.persist_state().await.unwrap(); // serial 1

        // B reads at serial 1, then a peer (simulated by writing the store
        // object directly) persists serial 5 with the same lineage.
        let mut b = backend.state_mgr(DEFAULT_WORKSPACE).await.unwrap();
        let seen_by_b = b.state().unwrap();
        assert_eq!(seen_by_b.serial, 1);
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let mut peer = seen_by_b.clone();
        peer.serial = 5;
        let bytes = encode_state(&peer, &Disabled).unwrap();
        store.put("env/state/default.gwstate", bytes).await.unwrap();

        let mut stale = seen_by_b;
        stale.put(sample_instance("a"));
        b.write_state(stale).unwrap();
        assert!(matches!(
            b.persist_state().await,
            Err(StateError::SerialRegression {
                persisted: 5,
                writing: 1
            })
        ));

        // Re-reading the peer's copy clears the conflict.
        b.refresh_state().await.unwrap();
        let mut fresh = b.state().unwrap();
        fresh.put(sample_instance("a"));
        b.write_state(fresh).unwrap();
        b.persist_state().await.unwrap();
        assert_eq!(b.state().unwrap().serial, 6);

        // And a writer whose lineage differs fails before it gets that far.
        let foreign = State::new();
        assert!(matches!(
            b.write_state(foreign),
            Err(StateError::LineageMismatch { .. })
        ));
    }
}
