use std::path::PathBuf;
use std::sync::Arc;

use crate::actions::{Action, ActionOutcome, DispatchSettings, Dispatcher};
use crate::config::AppConfig;
use crate::error::{ActionError, SyncError};
use crate::journal::{start_journal, Journal};
use crate::scheduler::{AnalyticalEngine, QueryScheduler};
use crate::state::{EntityStateStore, Subscription};
use crate::sync::{ProjectLayout, SyncService};

/// Everything one project needs at runtime, built once and passed down.
pub struct AppContext {
    cfg: AppConfig,
    layout: ProjectLayout,
    dispatcher: Dispatcher,
    journal: Option<(Journal, Subscription)>,
}

impl AppContext {
    pub async fn new(
        cfg: AppConfig,
        project_dir: impl Into<PathBuf>,
        engine: Arc<dyn AnalyticalEngine>,
    ) -> Result<Self, SyncError> {
        let layout = ProjectLayout::new(project_dir);
        let store = EntityStateStore::new();
        let scheduler = QueryScheduler::new(engine, cfg.scheduler.max_concurrency);
        let dispatcher = Dispatcher::new(
            store.clone(),
            scheduler,
            DispatchSettings::from(&cfg.scheduler),
        );

        let journal = start_journal(&cfg.journal, layout.root())
            .await?
            .map(|journal| {
                let sub = journal.tx().attach(&store);
                (journal, sub)
            });

        Ok(Self {
            cfg,
            layout,
            dispatcher,
            journal,
        })
    }

    pub fn cfg(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn store(&self) -> &EntityStateStore {
        self.dispatcher.store()
    }

    pub fn scheduler(&self) -> &QueryScheduler {
        self.dispatcher.scheduler()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// A sync service over this context's store and project directory.
    pub fn sync_service(&self) -> SyncService {
        SyncService::new(
            self.dispatcher.clone(),
            self.layout.clone(),
            self.cfg.sync.clone(),
        )
    }

    pub async fn dispatch(&self, action: Action) -> Result<ActionOutcome, ActionError> {
        self.dispatcher.dispatch(action).await
    }

    /// Stop accepting queries and drain the patch journal.
    pub async fn shutdown(self) {
        self.dispatcher.scheduler().shutdown();
        if let Some((journal, sub)) = self.journal {
            sub.unsubscribe();
            let dropped = journal.tx().dropped_count();
            if dropped > 0 {
                tracing::warn!(dropped, "patch journal dropped entries");
            }
            journal.close().await;
        }
    }
}
