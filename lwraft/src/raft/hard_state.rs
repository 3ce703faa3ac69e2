//! Durable record of the current term and the vote cast in it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_derive::{Deserialize, Serialize};

use crate::raft::error::StorageError;
use crate::raft::storage::write_atomic;
use crate::raft::NodeId;

const HARD_STATE_FILE: &str = "hard_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Storage for [`HardState`]. `save` must be durable before it returns.
pub trait HardStateStore: Send + 'static {
    fn load(&self) -> Result<HardState, StorageError>;

    fn save(&mut self, state: &HardState) -> Result<(), StorageError>;
}

/// Keeps the hard state in a single small file, replaced atomically.
pub struct FileHardStateStore {
    dir: PathBuf,
}

impl FileHardStateStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileHardStateStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }
}

impl HardStateStore for FileHardStateStore {
    fn load(&self) -> Result<HardState, StorageError> {
        match fs::read(self.dir.join(HARD_STATE_FILE)) {
            Ok(data) => Ok(bincode::deserialize(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, state: &HardState) -> Result<(), StorageError> {
        write_atomic(&self.dir, HARD_STATE_FILE, &bincode::serialize(state)?)
    }
}

#[derive(Debug, Default)]
struct MemHardState {
    state: HardState,
    fail_writes: bool,
}

/// In-memory hard state whose clones share one record.
#[derive(Debug, Clone, Default)]
pub struct MemHardStateStore {
    inner: Arc<Mutex<MemHardState>>,
}

impl MemHardStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).fail_writes = fail;
    }
}

impl HardStateStore for MemHardStateStore {
    fn load(&self) -> Result<HardState, StorageError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).state)
    }

    fn save(&mut self, state: &HardState) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.fail_writes {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "hard state store is failing writes",
            )));
        }
        inner.state = *state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let store = FileHardStateStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), HardState::default());
    }

    #[test]
    fn saved_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let state = HardState {
            term: 7,
            voted_for: Some(3),
        };
        {
            let mut store = FileHardStateStore::open(dir.path()).unwrap();
            store.save(&state).unwrap();
        }
        let store = FileHardStateStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), state);
        assert!(!dir.path().join("hard_state.tmp").exists());
    }

    #[test]
    fn mem_store_failure_keeps_old_state() {
        let mut store = MemHardStateStore::new();
        store.save(&HardState { term: 2, voted_for: None }).unwrap();
        store.set_fail_writes(true);
        assert!(store.save(&HardState { term: 3, voted_for: Some(1) }).is_err());
        assert_eq!(store.load().unwrap().term, 2);
    }
}
