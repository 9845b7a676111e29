//! Shared profiling pipeline for tables and models.

use super::dispatcher::Dispatcher;
use crate::error::ActionError;
use crate::scheduler::{describe, summarize, Described, QuerySession, Summary};
use crate::state::{DerivedModel, DerivedRecord, DerivedTable, EntityStatus, ProfileScope, Row};

/// Derived records that carry a column profile.
pub(super) trait Profiled: DerivedRecord {
    fn profile_scope(&self) -> ProfileScope;
    fn set_preview(&mut self, preview: Vec<Row>);
    fn set_summary(&mut self, summary: Summary, scope: ProfileScope);
}

macro_rules! profiled {
    ($ty:ty) => {
        impl Profiled for $ty {
            fn profile_scope(&self) -> ProfileScope {
                self.profile_scope
            }

            fn set_preview(&mut self, preview: Vec<Row>) {
                self.preview = preview;
            }

            fn set_summary(&mut self, summary: Summary, scope: ProfileScope) {
                self.cardinality = Some(summary.cardinality);
                self.profile = summary.columns;
                self.profile_scope = scope;
            }
        }
    };
}

profiled!(DerivedTable);
profiled!(DerivedModel);

impl Dispatcher {
    /// Histograms are only computed for the active entity.
    pub(super) fn scope_for(&self, id: &str) -> ProfileScope {
        if self.inner.scheduler.active().as_deref() == Some(id) {
            ProfileScope::Full
        } else {
            ProfileScope::Summary
        }
    }

    /// Describe `relation`, move the entity to Profiling, then summarize it.
    ///
    /// The describe step doubles as query validation for models. If the
    /// entity is activated while a summary-scope pass runs, one more pass in
    /// full scope follows.
    pub(super) async fn profile_relation<T: Profiled>(
        &self,
        session: &QuerySession,
        id: &str,
        relation: &str,
    ) -> Result<(), ActionError> {
        let settings = self.inner.settings;
        let Described { columns, preview } =
            describe(session, relation, settings.preview_rows).await?;

        self.commit(session, || {
            self.write_status_locked::<T>(id, EntityStatus::Profiling, None)?;
            self.inner
                .store
                .update_entity::<T, _>(id, |record| record.set_preview(preview))?;
            Ok(())
        })?;

        loop {
            let scope = self.scope_for(id);
            let summary = summarize(
                session,
                relation,
                &columns,
                scope,
                settings.histogram_buckets,
            )
            .await?;

            let rescan = self.commit(session, || {
                self.inner
                    .store
                    .update_entity::<T, _>(id, |record| record.set_summary(summary, scope))?;
                Ok(scope == ProfileScope::Summary && self.scope_for(id) == ProfileScope::Full)
            })?;
            if !rescan {
                return Ok(());
            }
            tracing::debug!(entity_id = %id, "activated while profiling, computing full profile");
        }
    }
}
