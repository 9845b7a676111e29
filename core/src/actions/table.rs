use chrono::Utc;
use std::path::PathBuf;

use super::dispatcher::Dispatcher;
use super::registry::{ActionOutcome, DropTableArgs, IdArgs, ImportTableArgs};
use super::status::not_found;
use crate::error::ActionError;
use crate::scheduler::{table_relation, Priority};
use crate::state::{new_entity_id, DerivedTable, EntityStatus, PersistentTable, SourceFormat};
use crate::util::{sanitize_entity_name, table_name_from_path};

/// Scheduler owner for engine calls that outlive the table's own sessions.
fn drop_owner(id: &str) -> String {
    format!("{id}/drop")
}

impl Dispatcher {
    pub(super) fn table_by_name(&self, name: &str) -> Result<Option<PersistentTable>, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<PersistentTable>()?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    /// Ids of the tables named in `names`, skipping unknown names.
    pub(super) fn table_ids(&self, names: &[String]) -> Result<Vec<String>, ActionError> {
        let tables = self.inner.store.get_current_state::<PersistentTable>()?;
        Ok(names
            .iter()
            .filter_map(|name| {
                tables
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(name))
                    .map(|t| t.id.clone())
            })
            .collect())
    }

    /// Add a table from a source file, or reload an existing one of the same
    /// name: Importing → engine load → Profiling → Idle.
    pub(super) async fn import_table(
        &self,
        args: ImportTableArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let path = PathBuf::from(&args.path);
        let format = SourceFormat::from_path(&path).ok_or_else(|| ActionError::InvalidArgs {
            action: "importTable",
            message: format!("unsupported source file {:?}", path),
        })?;
        let name = match args.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => sanitize_entity_name(n),
            _ => table_name_from_path(&path),
        };

        let now = Utc::now();
        let session = match self.table_by_name(&name)? {
            Some(existing) => {
                let id = existing.id;
                self.begin_with::<DerivedTable, _>(&id, EntityStatus::Importing, || {
                    self.inner
                        .store
                        .update_entity::<PersistentTable, _>(&id, |t| {
                            t.path = args.path.clone();
                            t.format = format;
                            t.updated_at = now;
                        })?;
                    Ok(())
                })?
            }
            None => {
                let table = PersistentTable {
                    id: new_entity_id(),
                    name: name.clone(),
                    path: args.path.clone(),
                    format,
                    created_at: now,
                    updated_at: now,
                };
                self.begin_new::<PersistentTable, DerivedTable>(table, EntityStatus::Importing)?
            }
        };
        let id = session.owner().to_string();
        tracing::info!(entity_id = %id, table = %name, path = %path.display(), "importing table");

        let result = async {
            let size_bytes = session.load_source(&name, path.clone(), format).await?;
            self.commit(&session, || {
                self.inner
                    .store
                    .update_entity::<DerivedTable, _>(&id, |t| t.size_bytes = Some(size_bytes))?;
                Ok(())
            })?;
            self.profile_relation::<DerivedTable>(&session, &id, &table_relation(&name))
                .await
        }
        .await;

        self.finish_pipeline::<DerivedTable>(&id, &session, result)
    }

    /// Drop the engine table, then delete both records.
    pub(super) async fn drop_table(&self, args: DropTableArgs) -> Result<ActionOutcome, ActionError> {
        let table = match self.table_by_name(&args.name)? {
            Some(t) => t,
            None => self
                .table_by_name(&sanitize_entity_name(&args.name))?
                .ok_or_else(|| not_found::<PersistentTable>(&args.name))?,
        };

        // A load still inside the engine would recreate the table.
        self.inner.scheduler.cancel_owner_and_wait(&table.id).await;
        let session = self
            .inner
            .scheduler
            .session(&drop_owner(&table.id), Priority::Background);
        session.drop_table(&table.name).await?;

        self.remove_entity::<PersistentTable, DerivedTable>(&table.id)?;
        tracing::info!(entity_id = %table.id, table = %table.name, "table dropped");
        Ok(ActionOutcome::completed(table.id))
    }

    pub(super) async fn profile_table(&self, args: IdArgs) -> Result<ActionOutcome, ActionError> {
        let table = self.persistent::<PersistentTable>(&args.id)?;
        self.reprofile_table(&table).await
    }

    pub(super) async fn reprofile_table(
        &self,
        table: &PersistentTable,
    ) -> Result<ActionOutcome, ActionError> {
        let session = self.begin::<DerivedTable>(&table.id, EntityStatus::Profiling)?;
        let result = self
            .profile_relation::<DerivedTable>(&session, &table.id, &table_relation(&table.name))
            .await;
        self.finish_pipeline::<DerivedTable>(&table.id, &session, result)
    }
}
