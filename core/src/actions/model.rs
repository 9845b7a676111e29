use chrono::Utc;

use super::dispatcher::Dispatcher;
use super::registry::{ActionOutcome, AddModelArgs, IdArgs, UpdateModelNameArgs, UpdateModelQueryArgs};
use crate::error::ActionError;
use crate::expr::{referenced_tables, sanitize_query};
use crate::scheduler::{model_relation, QuerySession};
use crate::state::{new_entity_id, DerivedModel, EntityStatus, PersistentModel};
use crate::util::{model_file_name, sanitize_entity_name};

/// Scheduler owner for a model's export, kept apart so query edits do not
/// supersede it.
pub(super) fn export_owner(id: &str) -> String {
    format!("{id}/export")
}

impl Dispatcher {
    pub(super) fn model_by_name(&self, name: &str) -> Result<Option<PersistentModel>, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<PersistentModel>()?
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(name)))
    }

    pub(super) async fn add_model(&self, args: AddModelArgs) -> Result<ActionOutcome, ActionError> {
        let name = sanitize_entity_name(&args.name);
        if self.model_by_name(&name)?.is_some() {
            return Err(ActionError::AlreadyExists {
                kind: "model",
                name,
            });
        }

        let now = Utc::now();
        let model = PersistentModel {
            id: new_entity_id(),
            file_name: model_file_name(&name),
            name,
            query: args.query,
            created_at: now,
            updated_at: now,
        };
        let id = model.id.clone();
        let query = model.query.clone();

        let session =
            self.begin_new::<PersistentModel, DerivedModel>(model, EntityStatus::Validating)?;
        let result = self.run_model_pipeline(&session, &id, &query).await;
        self.finish_pipeline::<DerivedModel>(&id, &session, result)
    }

    /// Set the query text and recompute everything derived from it.
    ///
    /// Any in-flight run for the model is superseded, even when the new text
    /// only differs in whitespace.
    pub(super) async fn update_model_query(
        &self,
        args: UpdateModelQueryArgs,
    ) -> Result<ActionOutcome, ActionError> {
        self.persistent::<PersistentModel>(&args.id)?;

        let now = Utc::now();
        let session = self.begin_with::<DerivedModel, _>(&args.id, EntityStatus::Validating, || {
            self.inner
                .store
                .update_entity::<PersistentModel, _>(&args.id, |m| {
                    m.query = args.query.clone();
                    m.updated_at = now;
                })?;
            Ok(())
        })?;
        tracing::debug!(entity_id = %args.id, priority = %session.priority(), "model query updated");

        let result = self.run_model_pipeline(&session, &args.id, &args.query).await;
        self.finish_pipeline::<DerivedModel>(&args.id, &session, result)
    }

    /// Rename a model; its file name follows.
    pub(super) fn update_model_name(
        &self,
        args: UpdateModelNameArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let model = self.persistent::<PersistentModel>(&args.id)?;
        let name = sanitize_entity_name(&args.name);
        if let Some(other) = self.model_by_name(&name)? {
            if other.id != model.id {
                return Err(ActionError::AlreadyExists {
                    kind: "model",
                    name,
                });
            }
        }

        self.inner
            .store
            .update_entity::<PersistentModel, _>(&model.id, |m| {
                m.file_name = model_file_name(&name);
                m.name = name.clone();
                m.updated_at = Utc::now();
            })?;
        tracing::info!(entity_id = %model.id, from = %model.name, to = %name, "model renamed");
        Ok(ActionOutcome::completed(model.id))
    }

    /// Delete both records; the sync service removes the backing file.
    pub(super) fn delete_model(&self, args: IdArgs) -> Result<ActionOutcome, ActionError> {
        self.persistent::<PersistentModel>(&args.id)?;
        self.inner.scheduler.cancel_owner(&export_owner(&args.id));
        self.remove_entity::<PersistentModel, DerivedModel>(&args.id)?;
        Ok(ActionOutcome::completed(args.id))
    }

    /// Full profile for an activated model whose last profile was summary-only.
    pub(super) async fn reprofile_model(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        let model = self.persistent::<PersistentModel>(id)?;
        let session = self.begin::<DerivedModel>(id, EntityStatus::Profiling)?;
        let result = self.run_model_pipeline(&session, id, &model.query).await;
        self.finish_pipeline::<DerivedModel>(id, &session, result)
    }

    /// Sanitize, extract source tables, then profile the query with the
    /// tables it reads from deprioritized.
    async fn run_model_pipeline(
        &self,
        session: &QuerySession,
        id: &str,
        query: &str,
    ) -> Result<(), ActionError> {
        let sanitized = sanitize_query(query);
        let sources = referenced_tables(&sanitized);
        let empty = sanitized.is_empty();

        self.commit(session, || {
            self.inner
                .store
                .update_entity::<DerivedModel, _>(id, |m| {
                    m.sanitized_query = sanitized.clone();
                    m.sources = sources.clone();
                    if empty {
                        m.profile.clear();
                        m.preview.clear();
                        m.cardinality = None;
                    }
                })?;
            Ok(())
        })?;
        if empty {
            return Ok(());
        }

        let dependencies = self.table_ids(&sources)?;
        let _deprioritized = self.inner.scheduler.deprioritize(dependencies);
        self.profile_relation::<DerivedModel>(session, id, &model_relation(&sanitized))
            .await
    }
}
