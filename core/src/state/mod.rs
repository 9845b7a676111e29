//! # Entity state
//!
//! Every entity exists twice: a persistent record (user-authored, file-backed)
//! and a derived record (computed by queries). Each (entity kind × state kind)
//! pair is one stream in the [`EntityStateStore`]; every mutation of a stream
//! is published to subscribers as an ordered batch of [`Patch`]es.

pub mod entities;
pub mod patch;
pub mod snapshot;
pub mod store;
pub mod transitions;
pub mod types;

pub use entities::{
    ActiveEntity, ColumnSummary, DerivedApplication, DerivedDimension, DerivedMeasure,
    DerivedMetricsDefinition, DerivedModel, DerivedRecord, DerivedTable, EntityRecord,
    HistogramBin, PersistentApplication, PersistentDimension, PersistentMeasure,
    PersistentMetricsDefinition, PersistentModel, PersistentTable, ProfileScope, RollupInterval,
    Row, SourceFormat, TimeGrain,
};
pub use patch::{apply_patch, diff_entities, Patch, PatchOp, PatchTarget};
pub use snapshot::{StateFiles, StateSnapshot};
pub use store::{EntityStateStore, PatchEvent, Subscription};
pub use transitions::StateTransition;
pub use types::{
    new_entity_id, ApplicationStatus, EntityId, EntityKind, EntityStatus, PatchOrigin, StateKind,
    StreamKey,
};
