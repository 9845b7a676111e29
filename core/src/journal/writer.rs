use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::JournalConfig;
use crate::error::SyncError;
use crate::state::{EntityKind, EntityStateStore, Patch, PatchEvent, PatchOrigin, StateKind, Subscription};

/// One line of the patch journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub state_kind: StateKind,
    pub version: u64,
    /// `local` or `remote:<peer>`.
    pub origin: String,
    pub patches: Vec<Patch>,
}

impl JournalEntry {
    pub fn from_event(event: &PatchEvent) -> Self {
        let origin = match &event.origin {
            PatchOrigin::Local => "local".to_string(),
            PatchOrigin::Remote(peer) => format!("remote:{peer}"),
        };
        Self {
            ts: Utc::now(),
            entity_kind: event.stream.entity_kind,
            state_kind: event.stream.state_kind,
            version: event.version,
            origin,
            patches: event.patches.clone(),
        }
    }
}

#[derive(Clone)]
enum LineSender {
    Bounded(mpsc::Sender<String>),
    Unbounded(mpsc::UnboundedSender<String>),
}

/// Sending half of the journal writer.
///
/// With `drop_when_full` the queue is bounded by `channel_capacity` and lines
/// that do not fit are counted and dropped; otherwise the queue is unbounded.
#[derive(Clone)]
pub struct JournalTx {
    tx: LineSender,
    dropped: Arc<AtomicU64>,
}

impl JournalTx {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn record(&self, event: &PatchEvent) {
        match serde_json::to_string(&JournalEntry::from_event(event)) {
            Ok(line) => self.send_line(line),
            Err(e) => tracing::warn!(error = %e, "failed to encode journal entry"),
        }
    }

    pub fn send_line(&self, line: String) {
        let delivered = match &self.tx {
            LineSender::Bounded(tx) => tx.try_send(line).is_ok(),
            LineSender::Unbounded(tx) => tx.send(line).is_ok(),
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Journal every patch event of `store`.
    pub fn attach(&self, store: &EntityStateStore) -> Subscription {
        let tx = self.clone();
        store.subscribe_patches(move |event| tx.record(event))
    }
}

/// A running journal writer.
pub struct Journal {
    tx: JournalTx,
    path: PathBuf,
    task: JoinHandle<()>,
}

impl Journal {
    pub fn tx(&self) -> JournalTx {
        self.tx.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every queued line is written. Outstanding [`JournalTx`]
    /// clones (including attached subscriptions) must be dropped first.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

/// Start the journal writer if enabled. Relative paths resolve against
/// `project_dir`.
pub async fn start_journal(
    cfg: &JournalConfig,
    project_dir: &Path,
) -> Result<Option<Journal>, SyncError> {
    if !cfg.enabled || cfg.path.trim().is_empty() {
        return Ok(None);
    }

    let path = {
        let p = PathBuf::from(&cfg.path);
        if p.is_absolute() {
            p
        } else {
            project_dir.join(p)
        }
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| SyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| SyncError::Io {
            path: path.clone(),
            source,
        })?;

    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, mut rx) = if cfg.drop_when_full {
        let (tx, rx) = mpsc::channel::<String>(cfg.channel_capacity.max(1));
        (LineSender::Bounded(tx), LineReceiver::Bounded(rx))
    } else {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        (LineSender::Unbounded(tx), LineReceiver::Unbounded(rx))
    };

    let log_path = path.clone();
    let task = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            if !line.ends_with('\n') {
                line.push('\n');
            }
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::error!(path = %log_path.display(), error = %e, "journal write failed");
                return;
            }
            if rx.is_empty() {
                let _ = file.flush().await;
            }
        }
        let _ = file.flush().await;
    });

    tracing::info!(path = %path.display(), "patch journal started");
    Ok(Some(Journal {
        tx: JournalTx { tx, dropped },
        path,
        task,
    }))
}

enum LineReceiver {
    Bounded(mpsc::Receiver<String>),
    Unbounded(mpsc::UnboundedReceiver<String>),
}

impl LineReceiver {
    async fn recv(&mut self) -> Option<String> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Bounded(rx) => rx.is_empty(),
            Self::Unbounded(rx) => rx.is_empty(),
        }
    }
}
