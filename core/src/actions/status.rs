//! Status bookkeeping shared by every action.
//!
//! Functions suffixed `_locked` expect the caller to hold the status lock;
//! the others take it themselves.

use std::sync::MutexGuard;

use super::dispatcher::Dispatcher;
use super::registry::ActionOutcome;
use crate::error::{ActionError, QueryError};
use crate::scheduler::QuerySession;
use crate::state::{
    new_entity_id, ApplicationStatus, DerivedApplication, DerivedDimension, DerivedMeasure,
    DerivedMetricsDefinition, DerivedModel, DerivedRecord, DerivedTable, EntityRecord,
    EntityStatus, PersistentApplication, StateTransition,
};
use crate::util::lock;

pub(super) fn not_found<T: EntityRecord>(key: &str) -> ActionError {
    ActionError::NotFound {
        kind: T::ENTITY_KIND.as_str(),
        key: key.to_string(),
    }
}

pub(super) fn is_superseded(err: &ActionError) -> bool {
    matches!(err, ActionError::Query(q) if q.is_superseded())
}

fn superseded(session: &QuerySession) -> ActionError {
    ActionError::Query(QueryError::Superseded {
        owner: session.owner().to_string(),
    })
}

impl Dispatcher {
    pub(super) fn status_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.status_lock)
    }

    pub(super) fn persistent<T: EntityRecord>(&self, id: &str) -> Result<T, ActionError> {
        self.inner
            .store
            .get_entity_by_id::<T>(id)?
            .ok_or_else(|| not_found::<T>(id))
    }

    pub(super) fn derived<T: DerivedRecord>(&self, id: &str) -> Result<T, ActionError> {
        self.inner
            .store
            .get_entity_by_id::<T>(id)?
            .ok_or_else(|| not_found::<T>(id))
    }

    pub(super) fn write_status_locked<T: DerivedRecord>(
        &self,
        id: &str,
        status: EntityStatus,
        error: Option<String>,
    ) -> Result<(), ActionError> {
        let current = self.derived::<T>(id)?;
        StateTransition::validate(current.status(), status)?;
        self.inner.store.update_entity::<T, _>(id, |record| {
            record.set_status(status);
            record.set_error(error);
        })?;
        if current.status() != status {
            tracing::debug!(
                entity_id = %id,
                kind = %T::ENTITY_KIND,
                from = current.status().as_str(),
                to = status.as_str(),
                "status changed"
            );
        }
        self.refresh_application_status_locked()
    }

    pub(super) fn set_status<T: DerivedRecord>(
        &self,
        id: &str,
        status: EntityStatus,
        error: Option<String>,
    ) -> Result<(), ActionError> {
        let _guard = self.status_guard();
        self.write_status_locked::<T>(id, status, error)
    }

    /// Start a pipeline run for an existing entity.
    pub(super) fn begin<T: DerivedRecord>(
        &self,
        id: &str,
        status: EntityStatus,
    ) -> Result<QuerySession, ActionError> {
        self.begin_with::<T, _>(id, status, || Ok(()))
    }

    /// Like [`Dispatcher::begin`], running `prepare` under the status lock
    /// once the transition is known to be valid. `prepare` must not take the
    /// lock itself.
    pub(super) fn begin_with<T, F>(
        &self,
        id: &str,
        status: EntityStatus,
        prepare: F,
    ) -> Result<QuerySession, ActionError>
    where
        T: DerivedRecord,
        F: FnOnce() -> Result<(), ActionError>,
    {
        let priority = self.priority_for(id);
        let _guard = self.status_guard();

        let current = self.derived::<T>(id)?;
        StateTransition::validate(current.status(), status)?;
        prepare()?;

        let session = self.inner.scheduler.session(id, priority);
        self.write_status_locked::<T>(id, status, None)?;
        Ok(session)
    }

    /// Create a new entity (both records) and open its first session.
    pub(super) fn begin_new<P, D>(
        &self,
        persistent: P,
        status: EntityStatus,
    ) -> Result<QuerySession, ActionError>
    where
        P: EntityRecord,
        D: DerivedRecord,
    {
        let id = persistent.id().to_string();
        let priority = self.priority_for(&id);
        let _guard = self.status_guard();
        self.insert_pair_locked::<P, D>(persistent, status)?;
        Ok(self.inner.scheduler.session(&id, priority))
    }

    /// Create a new entity that needs no queries.
    pub(super) fn create_entity<P, D>(
        &self,
        persistent: P,
        status: EntityStatus,
    ) -> Result<(), ActionError>
    where
        P: EntityRecord,
        D: DerivedRecord,
    {
        let _guard = self.status_guard();
        self.insert_pair_locked::<P, D>(persistent, status)
    }

    fn insert_pair_locked<P, D>(&self, persistent: P, status: EntityStatus) -> Result<(), ActionError>
    where
        P: EntityRecord,
        D: DerivedRecord,
    {
        let store = &self.inner.store;
        let id = persistent.id().to_string();
        store.insert(persistent)?;
        if let Err(e) = store.insert(D::fresh(id.clone(), status)) {
            store.remove::<P>(&id)?;
            return Err(e.into());
        }
        tracing::info!(entity_id = %id, kind = %P::ENTITY_KIND, "entity created");
        self.refresh_application_status_locked()
    }

    /// Delete both records of an entity and cancel its outstanding queries.
    pub(super) fn remove_entity<P, D>(&self, id: &str) -> Result<bool, ActionError>
    where
        P: EntityRecord,
        D: DerivedRecord,
    {
        let _guard = self.status_guard();
        self.inner.scheduler.cancel_owner(id);
        let store = &self.inner.store;
        store.remove::<D>(id)?;
        let existed = store.remove::<P>(id)?;
        if existed {
            tracing::info!(entity_id = %id, kind = %P::ENTITY_KIND, "entity deleted");
        }
        self.refresh_application_status_locked()?;
        Ok(existed)
    }

    /// Run `f` only if `session` is still the owner's latest.
    pub(super) fn commit<R, F>(&self, session: &QuerySession, f: F) -> Result<R, ActionError>
    where
        F: FnOnce() -> Result<R, ActionError>,
    {
        let _guard = self.status_guard();
        if !session.is_current() {
            return Err(superseded(session));
        }
        f()
    }

    /// Settle a pipeline: Idle on success, Error with the message on failure,
    /// nothing at all when a newer run took over.
    pub(super) fn finish_pipeline<T: DerivedRecord>(
        &self,
        id: &str,
        session: &QuerySession,
        result: Result<(), ActionError>,
    ) -> Result<ActionOutcome, ActionError> {
        let settled = match result {
            Ok(()) => self
                .commit(session, || {
                    self.write_status_locked::<T>(id, EntityStatus::Idle, None)
                })
                .map(|_| ActionOutcome::completed(id)),
            Err(e) if is_superseded(&e) => Err(e),
            Err(e) => {
                let message = e.to_string();
                self.commit(session, || {
                    self.write_status_locked::<T>(id, EntityStatus::Error, Some(message.clone()))
                })
                .map(|_| ActionOutcome::Failed {
                    id: id.to_string(),
                    error: message,
                })
            }
        };

        match settled {
            Err(e) if is_superseded(&e) => Ok(ActionOutcome::Superseded { id: id.to_string() }),
            other => other,
        }
    }

    /// The application entity, created on first use.
    pub(super) fn ensure_application_locked(&self) -> Result<PersistentApplication, ActionError> {
        let store = &self.inner.store;
        if let Some(app) = store
            .get_current_state::<PersistentApplication>()?
            .into_iter()
            .next()
        {
            return Ok(app);
        }

        let app = PersistentApplication {
            id: new_entity_id(),
            ..Default::default()
        };
        store.insert(app.clone())?;
        store.insert(DerivedApplication {
            id: app.id.clone(),
            status: ApplicationStatus::Idle,
        })?;
        tracing::info!(entity_id = %app.id, "application created");
        Ok(app)
    }

    /// Running iff any entity is busy. Writes nothing when unchanged.
    pub(super) fn refresh_application_status_locked(&self) -> Result<(), ActionError> {
        let busy = self.any_busy::<DerivedTable>()?
            || self.any_busy::<DerivedModel>()?
            || self.any_busy::<DerivedMetricsDefinition>()?
            || self.any_busy::<DerivedMeasure>()?
            || self.any_busy::<DerivedDimension>()?;
        let next = if busy {
            ApplicationStatus::Running
        } else {
            ApplicationStatus::Idle
        };

        self.ensure_application_locked()?;
        self.inner
            .store
            .update_state::<DerivedApplication, _, _>(|apps| {
                for app in apps.iter_mut() {
                    app.status = next;
                }
                Ok(())
            })?;
        Ok(())
    }

    fn any_busy<T: DerivedRecord>(&self) -> Result<bool, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<T>()?
            .iter()
            .any(|record| record.status().is_busy()))
    }
}
