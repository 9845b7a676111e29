//! Stable re-exports for consumers (`cli` and external crates).
//!
//! Prefer importing from `modelyard_core::api` instead of reaching into internal modules.

pub use crate::actions::{
    Action, ActionEnvelope, ActionName, ActionOutcome, AddDimensionArgs, AddMeasureArgs,
    AddModelArgs, CreateMetricsDefinitionArgs, DispatchSettings, Dispatcher, DropTableArgs,
    ExportFormat, ExportModelArgs, IdArgs, ImportTableArgs, InitProjectArgs, SetActiveEntityArgs,
    UpdateMeasureArgs, UpdateModelNameArgs, UpdateModelQueryArgs,
};
pub use crate::config::{
    load_for_project, AppConfig, JournalConfig, LoggingConfig, SchedulerConfig, SyncConfig,
    CONFIG_FILE_NAME,
};
pub use crate::context::AppContext;
pub use crate::error::{
    ActionError, CliError, EngineError, QueryError, StoreError, SyncError, TransitionError,
};
pub use crate::expr::{parse_expression, validate_measure, Expr, SyntaxError};
pub use crate::journal::{replay_journal, ReplayReport};
pub use crate::scheduler::{
    AnalyticalEngine, ColumnInfo, Priority, QueryResult, QueryScheduler, SchedulerStats,
};
pub use crate::state::{
    DerivedTable, EntityKind, EntityRecord, EntityStateStore, EntityStatus, Patch, PatchEvent,
    PatchOrigin, PersistentApplication, PersistentModel, PersistentTable, Row, SourceFormat,
    StateFiles, StateKind, StreamKey,
};
pub use crate::sync::{
    LineTransport, PatchBatch, ProjectLayout, RemoteHub, SyncConflict, SyncService, SyncStatus,
    Transport, WireMessage,
};
