use serde_json::Value;
use std::sync::{Arc, Mutex};

use super::registry::{Action, ActionOutcome};
use crate::config::SchedulerConfig;
use crate::error::ActionError;
use crate::scheduler::{Priority, QueryScheduler};
use crate::state::EntityStateStore;

/// Knobs the profiling pipelines read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub preview_rows: usize,
    pub histogram_buckets: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for DispatchSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            preview_rows: cfg.preview_rows,
            histogram_buckets: cfg.histogram_buckets,
        }
    }
}

/// Action dispatcher
///
/// Single entry point for every state-changing request. Persistent records are
/// mutated directly; derived records are filled in by pipelines that submit
/// their queries through one [`QuerySession`](crate::scheduler::QuerySession)
/// per run.
///
/// Starting a session and writing its results both happen under the status
/// lock, after checking the session is still current, so a superseded
/// pipeline can never overwrite the results of a newer one.
#[derive(Clone)]
pub struct Dispatcher {
    pub(super) inner: Arc<DispatcherInner>,
}

pub(super) struct DispatcherInner {
    pub store: EntityStateStore,
    pub scheduler: QueryScheduler,
    pub settings: DispatchSettings,
    /// Never held across an await.
    pub status_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: EntityStateStore,
        scheduler: QueryScheduler,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                scheduler,
                settings,
                status_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &EntityStateStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &QueryScheduler {
        &self.inner.scheduler
    }

    pub fn settings(&self) -> DispatchSettings {
        self.inner.settings
    }

    /// Run one action to completion.
    pub async fn dispatch(&self, action: Action) -> Result<ActionOutcome, ActionError> {
        let name = action.name();
        tracing::debug!(action = %name, "dispatch");

        let result = match action {
            Action::InitProject(args) => self.init_project(args),
            Action::ImportTable(args) => self.import_table(args).await,
            Action::DropTable(args) => self.drop_table(args).await,
            Action::ProfileTable(args) => self.profile_table(args).await,
            Action::AddModel(args) => self.add_model(args).await,
            Action::UpdateModelQuery(args) => self.update_model_query(args).await,
            Action::UpdateModelName(args) => self.update_model_name(args),
            Action::DeleteModel(args) => self.delete_model(args),
            Action::ExportModel(args) => self.export_model(args).await,
            Action::SetActiveEntity(args) => self.set_active_entity(args).await,
            Action::ClearActiveEntity => self.clear_active_entity(),
            Action::CreateMetricsDefinition(args) => self.create_metrics_definition(args),
            Action::DeleteMetricsDefinition(args) => self.delete_metrics_definition(args),
            Action::AddMeasure(args) => self.add_measure(args),
            Action::UpdateMeasure(args) => self.update_measure(args),
            Action::DeleteMeasure(args) => self.delete_measure(args),
            Action::AddDimension(args) => self.add_dimension(args).await,
            Action::DeleteDimension(args) => self.delete_dimension(args),
            Action::ValidateMetricsDefinition(args) => {
                self.validate_metrics_definition(args).await
            }
        };

        match &result {
            Ok(ActionOutcome::Failed { id, error }) => {
                tracing::warn!(action = %name, entity_id = %id, error = %error, "action failed")
            }
            Ok(ActionOutcome::Superseded { id }) => {
                tracing::debug!(action = %name, entity_id = %id, "action superseded")
            }
            Ok(ActionOutcome::Completed { .. }) => {}
            Err(e) => tracing::warn!(action = %name, error = %e, "action rejected"),
        }
        result
    }

    /// Decode and run a wire action.
    pub async fn dispatch_wire(&self, name: &str, args: Value) -> Result<ActionOutcome, ActionError> {
        let action = Action::from_wire(name, args)?;
        self.dispatch(action).await
    }

    /// Base priority of work started for `id`.
    pub(super) fn priority_for(&self, id: &str) -> Priority {
        if self.inner.scheduler.active().as_deref() == Some(id) {
            Priority::Interactive
        } else {
            Priority::Background
        }
    }
}
