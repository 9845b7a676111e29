use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::conflict::SyncConflict;
use super::disk::{DiskReconciler, TickReport};
use super::layout::ProjectLayout;
use super::remote::{LinkOptions, LinkReport, RemoteHub};
use super::transport::Transport;
use crate::actions::Dispatcher;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::state::{EntityKind, EntityStatus, StateKind, StreamKey};

/// Health of the sync loop, as reported to callers and status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub ticks: u64,
    pub consecutive_io_failures: u32,
    /// Set once failures reach the configured threshold; cleared by a good tick.
    pub last_io_error: Option<String>,
    pub conflicts: u64,
    pub last_conflict: Option<SyncConflict>,
    pub links: Vec<LinkReport>,
}

/// State synchronization service
///
/// Owns the disk reconciler and the remote hub of one project. Build it,
/// [`hydrate`](Self::hydrate) once, then either drive [`tick`](Self::tick)
/// by hand or hand control to [`run`](Self::run).
pub struct SyncService {
    dispatcher: Dispatcher,
    config: SyncConfig,
    reconciler: DiskReconciler,
    hub: RemoteHub,
    status: SyncStatus,
}

impl SyncService {
    pub fn new(dispatcher: Dispatcher, layout: ProjectLayout, config: SyncConfig) -> Self {
        let hub = RemoteHub::new(
            dispatcher.store().clone(),
            Some(dispatcher.clone()),
            LinkOptions {
                queue_capacity: config.push_queue_capacity,
                snapshot_on_connect: true,
                ..LinkOptions::default()
            },
        );
        Self {
            reconciler: DiskReconciler::new(dispatcher.clone(), layout),
            dispatcher,
            config,
            hub,
            status: SyncStatus::default(),
        }
    }

    pub fn layout(&self) -> &ProjectLayout {
        self.reconciler.layout()
    }

    pub fn hub(&self) -> &RemoteHub {
        &self.hub
    }

    /// Start replicating to a peer; returns its id.
    pub fn attach(&self, transport: Box<dyn Transport>) -> String {
        self.hub.attach(transport)
    }

    /// Load `state/*.json` into the store as whole-stream replacements.
    ///
    /// Derived records that were busy when the files were written have no
    /// pipeline behind them any more and come back as `Idle`. Returns the
    /// number of entities loaded.
    pub async fn hydrate(&mut self) -> Result<usize, SyncError> {
        let files = self.layout().state_files();
        let streams = tokio::task::spawn_blocking(move || {
            StreamKey::all()
                .map(|stream| files.load(stream).map(|entities| (stream, entities)))
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await
        .map_err(anyhow::Error::from)??;

        let store = self.dispatcher.store();
        let mut loaded = 0;
        for (stream, mut entities) in streams {
            if entities.is_empty() {
                continue;
            }
            if stream.state_kind == StateKind::Derived {
                let settled = entities
                    .iter_mut()
                    .map(|e| settle_status(stream.entity_kind, e))
                    .filter(|settled| *settled)
                    .count();
                if settled > 0 {
                    tracing::info!(stream = %stream, settled, "busy records reset after restart");
                }
            }
            loaded += entities.len();
            store.replace_stream(stream, entities)?;
        }

        self.reconciler.mark_streams_written();
        if let Some(active) = self.dispatcher.restore_active_entity()? {
            tracing::debug!(entity_id = %active.id, kind = %active.kind, "active entity restored");
        }
        tracing::info!(root = ?self.layout().root(), entities = loaded, "state hydrated");
        Ok(loaded)
    }

    /// One reconciliation pass with IO failure accounting.
    ///
    /// Failures are retried on the next tick; once they persist for
    /// `io_error_threshold` consecutive ticks they are logged as errors and
    /// surface in [`status`](Self::status).
    pub async fn tick(&mut self) -> Result<TickReport, SyncError> {
        self.status.ticks += 1;
        match self.reconciler.tick().await {
            Ok(report) => {
                if self.status.consecutive_io_failures > 0 {
                    tracing::info!(
                        failures = self.status.consecutive_io_failures,
                        "sync recovered"
                    );
                }
                self.status.consecutive_io_failures = 0;
                self.status.last_io_error = None;
                self.status.conflicts += report.conflicts.len() as u64;
                if let Some(conflict) = report.conflicts.last() {
                    self.status.last_conflict = Some(conflict.clone());
                }
                if !report.is_empty() {
                    tracing::debug!(
                        added = report.models_added,
                        updated = report.models_updated,
                        files = report.files_written,
                        streams = report.streams_written,
                        "sync tick"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                self.status.consecutive_io_failures += 1;
                let failures = self.status.consecutive_io_failures;
                if failures >= self.config.io_error_threshold.max(1) {
                    tracing::error!(failures, error = %e, "sync keeps failing");
                    self.status.last_io_error = Some(e.to_string());
                } else {
                    tracing::warn!(failures, error = %e, "sync tick failed, retrying");
                }
                Err(e)
            }
        }
    }

    /// Write dirty state streams only.
    pub async fn flush_state(&mut self) -> Result<usize, SyncError> {
        let mut report = TickReport::default();
        self.reconciler.write_dirty_streams(&mut report).await?;
        Ok(report.streams_written)
    }

    /// Wait for actions triggered by file edits.
    pub async fn settle(&mut self) {
        self.reconciler.settle().await;
    }

    /// Tick every `interval_ms` until `shutdown` resolves, then flush state
    /// and close remote links.
    pub async fn run<F>(&mut self, shutdown: F) -> SyncStatus
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval_ms = self.config.interval_ms, root = ?self.layout().root(), "sync loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    // Errors are counted and logged by `tick`.
                    let _ = self.tick().await;
                }
            }
        }

        if let Err(e) = self.flush_state().await {
            tracing::error!(error = %e, "final state flush failed");
        }
        let status = self.status();
        self.hub.close_all();
        tracing::info!(ticks = status.ticks, links = status.links.len(), "sync loop stopped");
        status
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            links: self.hub.reports(),
            ..self.status.clone()
        }
    }
}

fn settle_status(kind: EntityKind, entity: &mut Value) -> bool {
    let Some(status) = entity.get("status") else {
        return false;
    };
    let busy = match kind {
        EntityKind::Application => status != &json!("idle"),
        _ => serde_json::from_value::<EntityStatus>(status.clone())
            .map(|s| s.is_busy())
            .unwrap_or(false),
    };
    if busy {
        entity["status"] = json!("idle");
    }
    busy
}
