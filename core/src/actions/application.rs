use super::dispatcher::Dispatcher;
use super::profiling::Profiled;
use super::registry::{ActionOutcome, InitProjectArgs, SetActiveEntityArgs};
use crate::error::ActionError;
use crate::state::{
    ActiveEntity, DerivedModel, DerivedTable, EntityKind, EntityStatus,
    PersistentApplication, PersistentDimension, PersistentMeasure, PersistentMetricsDefinition,
    PersistentModel, PersistentTable, ProfileScope,
};

impl Dispatcher {
    /// Create or update the application entity.
    pub(super) fn init_project(&self, args: InitProjectArgs) -> Result<ActionOutcome, ActionError> {
        let _guard = self.status_guard();
        self.refresh_application_status_locked()?;
        let app = self.ensure_application_locked()?;

        self.inner
            .store
            .update_entity::<PersistentApplication, _>(&app.id, |a| {
                a.project_path = Some(args.project_path.clone());
                if args.database_path.is_some() {
                    a.database_path = args.database_path.clone();
                }
            })?;
        tracing::info!(entity_id = %app.id, project = %args.project_path, "project initialized");
        Ok(ActionOutcome::completed(app.id))
    }

    /// Mark an entity as open in the UI.
    ///
    /// Its queued queries jump ahead immediately. A settled table or model
    /// whose profile was computed in summary scope is re-profiled in full.
    pub(super) async fn set_active_entity(
        &self,
        args: SetActiveEntityArgs,
    ) -> Result<ActionOutcome, ActionError> {
        self.ensure_exists(args.kind, &args.id)?;
        self.write_active(Some(ActiveEntity {
            kind: args.kind,
            id: args.id.clone(),
        }))?;

        match args.kind {
            EntityKind::Table if self.needs_full_profile::<DerivedTable>(&args.id)? => {
                let table = self.persistent::<PersistentTable>(&args.id)?;
                self.reprofile_table(&table).await
            }
            EntityKind::Model if self.needs_full_profile::<DerivedModel>(&args.id)? => {
                self.reprofile_model(&args.id).await
            }
            _ => Ok(ActionOutcome::completed(args.id)),
        }
    }

    pub(super) fn clear_active_entity(&self) -> Result<ActionOutcome, ActionError> {
        self.write_active(None)?;
        Ok(ActionOutcome::Completed { id: None })
    }

    /// Re-apply the persisted active entity to the scheduler, e.g. after the
    /// store was hydrated from disk.
    pub fn restore_active_entity(&self) -> Result<Option<ActiveEntity>, ActionError> {
        let active = self
            .inner
            .store
            .get_current_state::<PersistentApplication>()?
            .into_iter()
            .next()
            .and_then(|app| app.active_entity);
        self.inner
            .scheduler
            .set_active(active.as_ref().map(|a| a.id.as_str()));
        Ok(active)
    }

    fn write_active(&self, active: Option<ActiveEntity>) -> Result<(), ActionError> {
        let _guard = self.status_guard();
        let app = self.ensure_application_locked()?;
        self.inner
            .scheduler
            .set_active(active.as_ref().map(|a| a.id.as_str()));
        self.inner
            .store
            .update_entity::<PersistentApplication, _>(&app.id, |a| a.active_entity = active)?;
        Ok(())
    }

    fn needs_full_profile<T: Profiled>(&self, id: &str) -> Result<bool, ActionError> {
        let record = self.derived::<T>(id)?;
        Ok(record.status() == EntityStatus::Idle && record.profile_scope() == ProfileScope::Summary)
    }

    fn ensure_exists(&self, kind: EntityKind, id: &str) -> Result<(), ActionError> {
        match kind {
            EntityKind::Table => self.persistent::<PersistentTable>(id).map(drop),
            EntityKind::Model => self.persistent::<PersistentModel>(id).map(drop),
            EntityKind::Application => self.persistent::<PersistentApplication>(id).map(drop),
            EntityKind::MetricsDefinition => {
                self.persistent::<PersistentMetricsDefinition>(id).map(drop)
            }
            EntityKind::Measure => self.persistent::<PersistentMeasure>(id).map(drop),
            EntityKind::Dimension => self.persistent::<PersistentDimension>(id).map(drop),
        }
    }
}
