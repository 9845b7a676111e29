use anyhow::Context;
use std::path::Path;

use super::writer::JournalEntry;
use crate::state::{EntityStateStore, PatchOrigin, StreamKey};

/// Outcome of replaying a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub entries: usize,
    pub patches_applied: usize,
    /// Lines that did not parse; skipped.
    pub skipped_lines: usize,
}

/// Rebuild a store by applying every journaled batch in file order.
pub fn replay_journal(path: &Path) -> anyhow::Result<(EntityStateStore, ReplayReport)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read journal {:?}", path))?;
    let store = EntityStateStore::new();
    let report = replay_into(&store, &text)?;
    Ok((store, report))
}

/// Apply journal lines to an existing store.
pub fn replay_into(store: &EntityStateStore, text: &str) -> anyhow::Result<ReplayReport> {
    let mut report = ReplayReport::default();

    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping unreadable journal line");
                report.skipped_lines += 1;
                continue;
            }
        };

        let stream = StreamKey::new(entry.entity_kind, entry.state_kind);
        report.patches_applied += store
            .apply_patches(stream, &entry.patches, PatchOrigin::Local)
            .with_context(|| format!("Failed to apply journal line {}", lineno + 1))?;
        report.entries += 1;
    }

    Ok(report)
}
