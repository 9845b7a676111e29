//! Append-only JSONL journal of patch events, and replay from it.

pub mod replay;
pub mod writer;

pub use crate::config::JournalConfig;
pub use replay::{replay_into, replay_journal, ReplayReport};
pub use writer::{start_journal, Journal, JournalEntry, JournalTx};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityStateStore, PersistentModel, StateSnapshot, StreamKey};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn model(id: &str, query: &str) -> PersistentModel {
        PersistentModel {
            id: id.into(),
            name: id.into(),
            query: query.into(),
            file_name: format!("{id}.sql"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_journal_replay_reproduces_store() {
        let dir = TempDir::new().unwrap();
        let cfg = JournalConfig {
            enabled: true,
            drop_when_full: false,
            ..JournalConfig::default()
        };
        let journal = start_journal(&cfg, dir.path()).await.unwrap().unwrap();
        let path = journal.path().to_path_buf();

        let store = EntityStateStore::new();
        let sub = journal.tx().attach(&store);
        store.insert(model("m1", "select 1")).unwrap();
        store.insert(model("m2", "select 2")).unwrap();
        store
            .update_entity::<PersistentModel, _>("m1", |m| m.query = "select 10".into())
            .unwrap();
        store.remove::<PersistentModel>("m2").unwrap();
        drop(sub);
        journal.close().await;

        let (replayed, report) = replay_journal(&path).unwrap();
        assert_eq!(report.entries, 4);
        assert_eq!(report.skipped_lines, 0);

        let key = StreamKey::new(
            crate::state::EntityKind::Model,
            crate::state::StateKind::Persistent,
        );
        assert_eq!(replayed.snapshot(key), store.snapshot(key));
        assert_eq!(
            StateSnapshot::capture(&replayed).streams,
            StateSnapshot::capture(&store).streams
        );
    }

    #[tokio::test]
    async fn test_disabled_journal() {
        let dir = TempDir::new().unwrap();
        let journal = start_journal(&JournalConfig::default(), dir.path())
            .await
            .unwrap();
        assert!(journal.is_none());
    }

    #[test]
    fn test_replay_skips_garbage() {
        let store = EntityStateStore::new();
        let report = replay_into(&store, "not json\n\n").unwrap();
        assert_eq!(report.skipped_lines, 1);
        assert_eq!(report.entries, 0);
    }
}
