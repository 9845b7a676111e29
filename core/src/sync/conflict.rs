use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictWinner {
    File,
    Memory,
}

/// A model whose `.sql` file and in-memory query both changed since the last
/// synchronized version. Never fatal: the winner is applied and the conflict
/// is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("SyncConflict on model '{model_id}' ({file}): {winner:?} wins")]
pub struct SyncConflict {
    pub model_id: String,
    pub file: String,
    pub file_modified: Option<DateTime<Utc>>,
    pub model_updated: DateTime<Utc>,
    pub winner: ConflictWinner,
}

impl SyncConflict {
    /// Last write wins; a tie or an unknown mtime keeps the in-memory query.
    pub fn resolve(
        model_id: &str,
        file: &str,
        file_modified: Option<DateTime<Utc>>,
        model_updated: DateTime<Utc>,
    ) -> Self {
        let winner = match file_modified {
            Some(mtime) if mtime > model_updated => ConflictWinner::File,
            _ => ConflictWinner::Memory,
        };
        Self {
            model_id: model_id.to_string(),
            file: file.to_string(),
            file_modified,
            model_updated,
            winner,
        }
    }
}
