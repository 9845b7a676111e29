//! One-shot project commands. Each opens the project, runs one action and
//! writes the state streams back before exiting.

use modelyard_core::api::{
    self as core_api, Action, ActionOutcome, AppConfig, AppContext, CliError, DerivedTable,
    EntityRecord, PersistentApplication, ProjectLayout, SyncService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commands::cli::{DropTableArgs, ImportTableArgs, InitArgs};
use crate::engine::SqliteEngine;

pub const DEFAULT_DATABASE: &str = "modelyard.db";

/// An opened project: hydrated store, engine and sync service.
pub struct Project {
    ctx: AppContext,
    sync: SyncService,
}

impl Project {
    /// Hydrate `dir` and attach its database (`database`, or the path recorded
    /// on the application, or `<dir>/modelyard.db`).
    pub async fn open(
        dir: &Path,
        cfg: AppConfig,
        database: Option<PathBuf>,
    ) -> Result<Self, CliError> {
        let layout = ProjectLayout::new(dir);
        layout.ensure()?;
        let database = match database {
            Some(path) => path,
            None => database_path(&layout)?,
        };
        let engine = SqliteEngine::open(&database)?;
        let ctx = AppContext::new(cfg, dir, Arc::new(engine)).await?;
        let mut sync = ctx.sync_service();
        let loaded = sync.hydrate().await?;
        tracing::debug!(root = %dir.display(), database = %database.display(), entities = loaded, "project opened");
        Ok(Self { ctx, sync })
    }

    pub fn ctx(&self) -> &AppContext {
        &self.ctx
    }

    pub fn into_parts(self) -> (AppContext, SyncService) {
        (self.ctx, self.sync)
    }

    /// Dispatch one action; a `Failed` outcome becomes an error.
    pub async fn run(&self, action: Action) -> Result<ActionOutcome, CliError> {
        let name = action.name();
        match self.ctx.dispatch(action).await? {
            ActionOutcome::Failed { error, .. } => Err(CliError::ActionFailed {
                action: name.to_string(),
                message: error,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Write state streams and stop the scheduler.
    pub async fn close(mut self) -> Result<(), CliError> {
        let written = self.sync.flush_state().await?;
        tracing::debug!(streams = written, "state written");
        self.ctx.shutdown().await;
        Ok(())
    }
}

fn database_path(layout: &ProjectLayout) -> Result<PathBuf, CliError> {
    let stored = layout
        .state_files()
        .load(PersistentApplication::stream())?
        .into_iter()
        .next()
        .map(serde_json::from_value::<PersistentApplication>)
        .transpose()
        .map_err(anyhow::Error::from)?
        .and_then(|app| app.database_path);

    Ok(match stored {
        Some(path) if Path::new(&path).is_absolute() => PathBuf::from(path),
        Some(path) => layout.root().join(path),
        None => layout.root().join(DEFAULT_DATABASE),
    })
}

/// Handle `init`
pub async fn handle_init(args: InitArgs, cfg: AppConfig) -> Result<(), CliError> {
    std::fs::create_dir_all(&args.path)?;
    let root = std::fs::canonicalize(&args.path)?;

    let database = match &args.db {
        Some(db) if args.copy => {
            let file_name = db
                .file_name()
                .ok_or_else(|| CliError::Command(format!("not a file: {}", db.display())))?;
            let target = root.join(file_name);
            if std::fs::canonicalize(db)? != target {
                std::fs::copy(db, &target)?;
                tracing::info!(from = %db.display(), to = %target.display(), "database copied");
            }
            Some(target)
        }
        Some(db) => Some(std::fs::canonicalize(db)?),
        None => None,
    };

    let project = Project::open(&root, cfg, database.clone()).await?;
    let result = project
        .run(Action::InitProject(core_api::InitProjectArgs {
            project_path: root.display().to_string(),
            database_path: database.map(|p| p.display().to_string()),
        }))
        .await;
    project.close().await?;
    result?;

    let layout = ProjectLayout::new(&root);
    let config_path = layout.config_path();
    if !config_path.exists() {
        let content = toml::to_string_pretty(&AppConfig::default())
            .map_err(|e| CliError::Config(e.to_string()))?;
        std::fs::write(&config_path, content)?;
    }

    println!("Initialized project at {}", root.display());
    Ok(())
}

/// Handle `import-table`
pub async fn handle_import_table(args: ImportTableArgs, cfg: AppConfig) -> Result<(), CliError> {
    let source = std::fs::canonicalize(&args.file)?;
    let project = Project::open(&args.project, cfg, None).await?;
    let result = project
        .run(Action::ImportTable(core_api::ImportTableArgs {
            path: source.display().to_string(),
            name: args.name,
        }))
        .await;

    let table = match &result {
        Ok(outcome) => outcome
            .id()
            .map(|id| project.ctx().store().get_entity_by_id::<DerivedTable>(id))
            .transpose()
            .map_err(|e| CliError::Action(e.into()))?
            .flatten(),
        Err(_) => None,
    };
    project.close().await?;
    result?;

    match table {
        Some(table) => println!(
            "Imported {}: {} rows, {} columns",
            source.display(),
            table.cardinality.unwrap_or(0),
            table.profile.len()
        ),
        None => println!("Imported {}", source.display()),
    }
    Ok(())
}

/// Handle `drop-table`
pub async fn handle_drop_table(args: DropTableArgs, cfg: AppConfig) -> Result<(), CliError> {
    let project = Project::open(&args.project, cfg, None).await?;
    let result = project
        .run(Action::DropTable(core_api::DropTableArgs {
            name: args.name.clone(),
        }))
        .await;
    project.close().await?;
    result?;

    println!("Dropped table {}", args.name);
    Ok(())
}
