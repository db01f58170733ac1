//! Durable engine state: queue table, parked conflicts, sync markers.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictList, SyncMarker};
use crate::error::{EngineError, EngineResult};
use crate::operation::Rejection;
use crate::queue::QueueEntry;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub conflicts: ConflictList,
    #[serde(default)]
    pub markers: Vec<SyncMarker>,
    /// Keys whose last payload was rejected as invalid.
    #[serde(default)]
    pub rejected: Vec<Rejection>,
    /// Providers whose credential was rejected or revoked.
    #[serde(default)]
    pub disconnected: BTreeSet<String>,
    #[serde(default)]
    pub last_full_sync: Option<DateTime<Utc>>,
}

/// JSON file written atomically after every mutation.
/// A store without a path keeps nothing and always loads empty.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        StateStore { path }
    }

    pub fn in_memory() -> Self {
        StateStore { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> EngineResult<PersistedState> {
        let Some(path) = &self.path else {
            return Ok(PersistedState::default());
        };
        if !path.exists() {
            return Ok(PersistedState::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let state: PersistedState = serde_json::from_str(&contents).map_err(|e| {
            EngineError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        if state.version > STATE_VERSION {
            return Err(EngineError::Config(format!(
                "{} was written by a newer version (state version {})",
                path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    pub fn save(&self, state: &PersistedState) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let state = PersistedState {
            version: STATE_VERSION,
            ..state.clone()
        };
        let mut state_json = serde_json::to_vec_pretty(&state)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        state_json.push(b'\n');

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&state_json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, SyncOperation};
    use crate::queue::EntryState;
    use tempfile::TempDir;

    #[test]
    fn in_memory_store_loads_empty() {
        let store = StateStore::in_memory();
        store.save(&PersistedState::default()).unwrap();
        assert!(store.load().unwrap().queue.is_empty());
    }

    #[test]
    fn persists_queue_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("sync-state.json");

        let mut state = PersistedState::default();
        state.queue.push(QueueEntry {
            op: SyncOperation::new(OperationKind::Create, 4, "google", None),
            state: EntryState::Pending,
        });
        state.disconnected.insert("outlook".into());
        StateStore::new(Some(path.clone())).save(&state).unwrap();

        let loaded = StateStore::new(Some(path.clone())).load().unwrap();
        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.queue, state.queue);
        assert!(loaded.disconnected.contains("outlook"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn newer_state_version_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync-state.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        assert!(StateStore::new(Some(path)).load().is_err());
    }
}
