//! # Action dispatcher
//!
//! Every state change enters through [`Dispatcher::dispatch`], whether it
//! comes from the CLI, a remote `{action, args}` envelope or in-process code.
//!
//! Per-entity status machine:
//!
//! ```text
//!   Idle ──▶ Importing ──▶ Profiling ──▶ Idle
//!     │  └─▶ Validating ─┘
//!     └────▶ Exporting ──▶ Idle
//!   any ──▶ Error ──▶ (fresh action)
//! ```
//!
//! Each transition is a store mutation and therefore a patch.

mod application;
mod dispatcher;
mod export;
mod metrics;
mod model;
mod profiling;
pub mod registry;
mod status;
mod table;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use registry::{
    Action, ActionEnvelope, ActionName, ActionOutcome, AddDimensionArgs, AddMeasureArgs,
    AddModelArgs, CreateMetricsDefinitionArgs, DropTableArgs, ExportFormat, ExportModelArgs,
    IdArgs, ImportTableArgs, InitProjectArgs, SetActiveEntityArgs, UpdateMeasureArgs,
    UpdateModelNameArgs, UpdateModelQueryArgs,
};
