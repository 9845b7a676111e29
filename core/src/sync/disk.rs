//! Disk ⇄ memory reconciliation for one project directory.
//!
//! Each tick compares `models/*.sql` with the persistent Model stream and
//! writes whichever side is behind, then writes every state stream whose
//! version moved since it was last written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::task::JoinHandle;

use super::conflict::{ConflictWinner, SyncConflict};
use super::layout::ProjectLayout;
use crate::actions::{Action, AddModelArgs, Dispatcher, UpdateModelQueryArgs};
use crate::error::SyncError;
use crate::state::{EntityId, PersistentModel, StateFiles, StreamKey};
use crate::util::{lock, model_file_name, sanitize_entity_name};

/// Content fingerprint recorded for every file the reconciler agrees with.
pub fn fingerprint(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Version marker for a model file: what the file held and which query text
/// it matched when the reconciler last synchronized it.
#[derive(Debug, Clone)]
struct TrackedFile {
    model_id: EntityId,
    fingerprint: u64,
    synced_query: String,
}

impl TrackedFile {
    fn new(model_id: &str, content: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            fingerprint: fingerprint(content),
            synced_query: content.to_string(),
        }
    }
}

#[derive(Debug)]
struct DiskFile {
    content: String,
    fingerprint: u64,
    modified: Option<DateTime<Utc>>,
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub models_added: usize,
    pub models_updated: usize,
    pub files_written: usize,
    pub files_removed: usize,
    pub streams_written: usize,
    pub conflicts: Vec<SyncConflict>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Disk reconciler
///
/// Actions triggered by file edits run on spawned tasks so a slow pipeline
/// never stalls the loop. While such a task runs its file is "in flight":
/// the reconciler neither rewrites nor deletes it.
pub struct DiskReconciler {
    dispatcher: Dispatcher,
    layout: ProjectLayout,
    files: StateFiles,
    /// Keyed by file name under `models/`.
    tracked: HashMap<String, TrackedFile>,
    inflight: Arc<Mutex<HashMap<String, usize>>>,
    pending: Vec<JoinHandle<()>>,
    /// Files that cannot become a model; warned about once.
    ignored: HashSet<String>,
    written: HashMap<StreamKey, u64>,
}

impl DiskReconciler {
    pub fn new(dispatcher: Dispatcher, layout: ProjectLayout) -> Self {
        let files = layout.state_files();
        Self {
            dispatcher,
            layout,
            files,
            tracked: HashMap::new(),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            pending: Vec::new(),
            ignored: HashSet::new(),
            written: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Treat every stream's current version as already on disk.
    pub fn mark_streams_written(&mut self) {
        let store = self.dispatcher.store();
        self.written = StreamKey::all()
            .map(|stream| (stream, store.version(stream)))
            .collect();
    }

    /// Number of file-triggered actions still running.
    pub fn pending_actions(&mut self) -> usize {
        self.pending.retain(|h| !h.is_finished());
        self.pending.len()
    }

    /// Wait for every file-triggered action spawned so far.
    pub async fn settle(&mut self) {
        for handle in self.pending.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "file sync task failed");
            }
        }
    }

    /// One reconciliation pass. Both halves run even when the first fails;
    /// the first error is returned.
    pub async fn tick(&mut self) -> Result<TickReport, SyncError> {
        self.pending.retain(|h| !h.is_finished());
        let mut report = TickReport::default();
        let models = self.sync_models(&mut report).await;
        let streams = self.write_dirty_streams(&mut report).await;
        models.and(streams).map(|_| report)
    }

    /// Write every stream whose version changed since its last write.
    pub async fn write_dirty_streams(&mut self, report: &mut TickReport) -> Result<(), SyncError> {
        let store = self.dispatcher.store().clone();
        for stream in StreamKey::all() {
            let version = store.version(stream);
            if self.written.get(&stream) == Some(&version) {
                continue;
            }
            let entities = store.snapshot(stream);
            let files = self.files.clone();
            tokio::task::spawn_blocking(move || files.save(stream, &entities))
                .await
                .map_err(anyhow::Error::from)??;
            self.written.insert(stream, version);
            report.streams_written += 1;
            tracing::trace!(stream = %stream, version, "state stream written");
        }
        Ok(())
    }

    async fn sync_models(&mut self, report: &mut TickReport) -> Result<(), SyncError> {
        let dir = self.layout.models_dir();
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let models: HashMap<EntityId, PersistentModel> = self
            .dispatcher
            .store()
            .get_current_state::<PersistentModel>()?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        self.follow_renames(&models, report).await?;
        let mut on_disk = self.scan(&dir).await?;

        let names: Vec<String> = on_disk.keys().cloned().collect();
        for file in names {
            if self.tracked.contains_key(&file) {
                self.reconcile_tracked(&file, &on_disk, &models, report).await?;
            } else if !self.is_inflight(&file) {
                self.reconcile_untracked(file, &mut on_disk, &models, report)
                    .await?;
            }
        }

        self.reconcile_missing(&on_disk, &models, report).await?;
        self.write_behind_files(&models, report).await?;

        self.ignored.retain(|f| on_disk.contains_key(f));
        Ok(())
    }

    /// Move files of renamed models to their new name.
    async fn follow_renames(
        &mut self,
        models: &HashMap<EntityId, PersistentModel>,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let renamed: Vec<(String, PersistentModel)> = self
            .tracked
            .iter()
            .filter_map(|(file, marker)| {
                let model = models.get(&marker.model_id)?;
                (model.file_name != *file).then(|| (file.clone(), model.clone()))
            })
            .collect();

        for (old, model) in renamed {
            if self.is_inflight(&old) {
                continue;
            }
            self.write_model_file(&model, report).await?;
            self.remove_model_file(&old, report).await?;
            self.tracked.remove(&old);
            tracing::info!(entity_id = %model.id, from = %old, to = %model.file_name, "model file renamed");
        }
        Ok(())
    }

    async fn scan(&mut self, dir: &Path) -> Result<BTreeMap<String, DiskFile>, SyncError> {
        let pattern = format!(
            "{}/*.sql",
            glob::Pattern::escape(&dir.to_string_lossy())
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| io_error(dir)(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let mut out = BTreeMap::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(path = ?e.path(), error = %e, "unreadable models entry");
                    continue;
                }
            };
            let Some(file) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !path.is_file() || self.ignored.contains(&file) {
                continue;
            }

            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(file = %file, "model file is not UTF-8, ignoring it");
                    self.ignored.insert(file);
                    continue;
                }
                Err(e) => return Err(io_error(&path)(e)),
            };
            let modified = fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            out.insert(
                file,
                DiskFile {
                    fingerprint: fingerprint(&content),
                    content,
                    modified,
                },
            );
        }
        Ok(out)
    }

    async fn reconcile_tracked(
        &mut self,
        file: &str,
        on_disk: &BTreeMap<String, DiskFile>,
        models: &HashMap<EntityId, PersistentModel>,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let (Some(disk), Some(marker)) = (on_disk.get(file), self.tracked.get(file).cloned()) else {
            return Ok(());
        };
        if disk.fingerprint == marker.fingerprint {
            return Ok(());
        }
        // Deleted model: the file goes in `reconcile_missing`.
        let Some(model) = models.get(&marker.model_id) else {
            return Ok(());
        };

        if model.query == disk.content {
            self.tracked
                .insert(file.to_string(), TrackedFile::new(&model.id, &disk.content));
            return Ok(());
        }

        let memory_changed = model.query != marker.synced_query;
        if memory_changed && !self.is_inflight(file) {
            let conflict =
                SyncConflict::resolve(&model.id, file, disk.modified, model.updated_at);
            tracing::warn!(
                entity_id = %model.id,
                file = %file,
                winner = ?conflict.winner,
                "SyncConflict: file and model both changed"
            );
            let winner = conflict.winner;
            report.conflicts.push(conflict);
            if winner == ConflictWinner::Memory {
                return self.write_model_file(model, report).await;
            }
        }

        self.apply_file_edit(file, model, &disk.content, report);
        Ok(())
    }

    async fn reconcile_untracked(
        &mut self,
        mut file: String,
        on_disk: &mut BTreeMap<String, DiskFile>,
        models: &HashMap<EntityId, PersistentModel>,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let owner = |file: &str| models.values().find(|m| m.file_name == file).cloned();

        let mut model = owner(&file);
        if model.is_none() {
            let name = file_stem(&file);
            let target = model_file_name(&sanitize_entity_name(&name));
            if target != file {
                let target_path = self.layout.model_path(&target);
                if on_disk.contains_key(&target) || target_path.exists() {
                    tracing::warn!(file = %file, target = %target, "model file name is taken, ignoring it");
                    self.ignored.insert(file);
                    return Ok(());
                }
                let path = self.layout.model_path(&file);
                fs::rename(&path, &target_path)
                    .await
                    .map_err(io_error(&path))?;
                tracing::info!(from = %file, to = %target, "model file renamed to its model name");
                if let Some(disk) = on_disk.remove(&file) {
                    on_disk.insert(target.clone(), disk);
                }
                file = target;
                model = owner(&file);
            }
        }

        let Some(disk) = on_disk.get(&file) else {
            return Ok(());
        };

        match model {
            Some(model) if model.query == disk.content => {
                self.tracked
                    .insert(file, TrackedFile::new(&model.id, &disk.content));
            }
            Some(model) => {
                // Adopting a file that disagrees with the model: no common
                // version to compare against, so the newer write wins.
                let conflict =
                    SyncConflict::resolve(&model.id, &file, disk.modified, model.updated_at);
                tracing::warn!(
                    entity_id = %model.id,
                    file = %file,
                    winner = ?conflict.winner,
                    "SyncConflict: existing file disagrees with model"
                );
                let winner = conflict.winner;
                report.conflicts.push(conflict);
                match winner {
                    ConflictWinner::Memory => self.write_model_file(&model, report).await?,
                    ConflictWinner::File => {
                        let content = disk.content.clone();
                        self.apply_file_edit(&file, &model, &content, report);
                    }
                }
            }
            None => {
                let name = sanitize_entity_name(&file_stem(&file));
                tracing::info!(file = %file, name = %name, "new model file");
                let action = Action::AddModel(AddModelArgs {
                    name,
                    query: disk.content.clone(),
                });
                self.spawn_dispatch(file, action);
                report.models_added += 1;
            }
        }
        Ok(())
    }

    /// Tracked files missing on disk, and files of deleted models.
    async fn reconcile_missing(
        &mut self,
        on_disk: &BTreeMap<String, DiskFile>,
        models: &HashMap<EntityId, PersistentModel>,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let tracked: Vec<(String, EntityId)> = self
            .tracked
            .iter()
            .map(|(file, marker)| (file.clone(), marker.model_id.clone()))
            .collect();

        for (file, model_id) in tracked {
            if self.is_inflight(&file) {
                continue;
            }
            match (models.get(&model_id), on_disk.contains_key(&file)) {
                (Some(_), true) => {}
                (Some(model), false) => {
                    tracing::info!(entity_id = %model.id, file = %file, "model file deleted, rewriting it");
                    self.write_model_file(model, report).await?;
                }
                (None, true) => {
                    self.remove_model_file(&file, report).await?;
                    self.tracked.remove(&file);
                    tracing::info!(entity_id = %model_id, file = %file, "model deleted, file removed");
                }
                (None, false) => {
                    self.tracked.remove(&file);
                }
            }
        }
        Ok(())
    }

    /// Files that lag behind their model, and models without a file.
    async fn write_behind_files(
        &mut self,
        models: &HashMap<EntityId, PersistentModel>,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let by_model: HashMap<EntityId, String> = self
            .tracked
            .iter()
            .map(|(file, marker)| (marker.model_id.clone(), file.clone()))
            .collect();

        for model in models.values() {
            if self.is_inflight(&model.file_name) {
                continue;
            }
            let behind = match by_model.get(&model.id) {
                Some(file) => self
                    .tracked
                    .get(file)
                    .map(|marker| marker.synced_query != model.query)
                    .unwrap_or(true),
                None => true,
            };
            if behind {
                self.write_model_file(model, report).await?;
            }
        }
        Ok(())
    }

    fn apply_file_edit(
        &mut self,
        file: &str,
        model: &PersistentModel,
        content: &str,
        report: &mut TickReport,
    ) {
        tracing::info!(entity_id = %model.id, file = %file, "model file changed");
        self.tracked
            .insert(file.to_string(), TrackedFile::new(&model.id, content));
        let action = Action::UpdateModelQuery(UpdateModelQueryArgs {
            id: model.id.clone(),
            query: content.to_string(),
        });
        self.spawn_dispatch(file.to_string(), action);
        report.models_updated += 1;
    }

    async fn write_model_file(
        &mut self,
        model: &PersistentModel,
        report: &mut TickReport,
    ) -> Result<(), SyncError> {
        let path = self.layout.model_path(&model.file_name);
        fs::write(&path, &model.query)
            .await
            .map_err(io_error(&path))?;
        self.tracked.insert(
            model.file_name.clone(),
            TrackedFile::new(&model.id, &model.query),
        );
        report.files_written += 1;
        tracing::debug!(entity_id = %model.id, file = %model.file_name, "model file written");
        Ok(())
    }

    async fn remove_model_file(&mut self, file: &str, report: &mut TickReport) -> Result<(), SyncError> {
        let path = self.layout.model_path(file);
        match fs::remove_file(&path).await {
            Ok(()) => {
                report.files_removed += 1;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn is_inflight(&self, file: &str) -> bool {
        lock(&self.inflight).contains_key(file)
    }

    fn spawn_dispatch(&mut self, file: String, action: Action) {
        *lock(&self.inflight).entry(file.clone()).or_insert(0) += 1;

        let dispatcher = self.dispatcher.clone();
        let inflight = self.inflight.clone();
        self.pending.push(tokio::spawn(async move {
            let name = action.name();
            if let Err(e) = dispatcher.dispatch(action).await {
                tracing::warn!(file = %file, action = %name, error = %e, "file change not applied");
            }
            let mut inflight = lock(&inflight);
            if let Some(count) = inflight.get_mut(&file) {
                *count -= 1;
                if *count == 0 {
                    inflight.remove(&file);
                }
            }
        }));
    }
}

fn file_stem(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
