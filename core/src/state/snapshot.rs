//! Per-stream state files and whole-store snapshots

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::store::EntityStateStore;
use super::types::StreamKey;

/// A copy of every stream at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    /// Keyed by `StreamKey` display form, e.g. `persistent_table`.
    pub streams: BTreeMap<String, Vec<Value>>,
}

impl StateSnapshot {
    pub fn capture(store: &EntityStateStore) -> Self {
        let streams = StreamKey::all()
            .map(|key| (key.to_string(), store.snapshot(key)))
            .collect();
        Self {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            streams,
        }
    }

    pub fn stream(&self, key: StreamKey) -> &[Value] {
        self.streams
            .get(&key.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize snapshot")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize snapshot")
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    entities: Vec<Value>,
}

/// Reads and writes `<dir>/<state>_<kind>_state.json`, each holding
/// `{"entities": [...]}` in creation order.
#[derive(Debug, Clone)]
pub struct StateFiles {
    dir: PathBuf,
}

impl StateFiles {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stream: StreamKey) -> PathBuf {
        self.dir.join(stream.file_name())
    }

    /// Load one stream. A missing file is an empty stream.
    pub fn load(&self, stream: StreamKey) -> Result<Vec<Value>> {
        let path = self.path(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file {:?}", path))?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: StateFile = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse state file {:?}", path))?;
        Ok(file.entities)
    }

    /// Write one stream through a temp file and rename.
    pub fn save(&self, stream: StreamKey, entities: &[Value]) -> Result<PathBuf> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("Failed to create state directory: {:?}", self.dir))?;
        }

        let path = self.path(stream);
        let tmp = path.with_extension("json.tmp");
        let file = StateFile {
            entities: entities.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)
            .with_context(|| format!("Failed to serialize stream {}", stream))?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move {:?} into place", tmp))?;
        Ok(path)
    }

    /// Streams with a state file on disk.
    pub fn list(&self) -> Result<Vec<StreamKey>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        Ok(StreamKey::all()
            .filter(|key| self.path(*key).is_file())
            .collect())
    }

    pub fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        for key in StreamKey::all() {
            self.save(key, snapshot.stream(key))?;
        }
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<StateSnapshot> {
        let mut streams = BTreeMap::new();
        for key in StreamKey::all() {
            streams.insert(key.to_string(), self.load(key)?);
        }
        Ok(StateSnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{EntityKind, StateKind};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_stream() {
        let temp_dir = TempDir::new().unwrap();
        let files = StateFiles::new(temp_dir.path().join("state"));
        let key = StreamKey::new(EntityKind::Table, StateKind::Persistent);

        let entities = vec![json!({"id": "t1", "name": "orders"})];
        let path = files.save(key, &entities).unwrap();
        assert!(path.ends_with("persistent_table_state.json"));
        assert_eq!(files.load(key).unwrap(), entities);
        assert_eq!(files.list().unwrap(), vec![key]);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["entities"][0]["id"], "t1");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let files = StateFiles::new(temp_dir.path());
        let key = StreamKey::new(EntityKind::Model, StateKind::Derived);
        assert!(files.load(key).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_through_files() {
        let temp_dir = TempDir::new().unwrap();
        let files = StateFiles::new(temp_dir.path());
        let store = EntityStateStore::new();
        let key = StreamKey::new(EntityKind::Model, StateKind::Persistent);
        store
            .replace_stream(key, vec![json!({"id": "m1", "name": "a"})])
            .unwrap();

        let snapshot = StateSnapshot::capture(&store);
        files.save_snapshot(&snapshot).unwrap();
        let loaded = files.load_snapshot().unwrap();
        assert_eq!(loaded.streams, snapshot.streams);

        let restored = StateSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(restored.stream(key).len(), 1);
    }
}
