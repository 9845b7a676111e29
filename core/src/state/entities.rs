//! Typed entity records, one struct per (entity kind × state kind) stream.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::types::{ApplicationStatus, EntityId, EntityKind, EntityStatus, StateKind, StreamKey};

/// A single result row, column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A record stored in one stream of the entity state store.
pub trait EntityRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ENTITY_KIND: EntityKind;
    const STATE_KIND: StateKind;

    fn id(&self) -> &str;

    fn stream() -> StreamKey {
        StreamKey::new(Self::ENTITY_KIND, Self::STATE_KIND)
    }
}

/// Derived records that follow the per-entity status machine.
pub trait DerivedRecord: EntityRecord {
    fn fresh(id: EntityId, status: EntityStatus) -> Self;
    fn status(&self) -> EntityStatus;
    fn set_status(&mut self, status: EntityStatus);
    fn error(&self) -> Option<&str>;
    fn set_error(&mut self, error: Option<String>);
}

macro_rules! entity_record {
    ($ty:ty, $kind:ident, $state:ident) => {
        impl EntityRecord for $ty {
            const ENTITY_KIND: EntityKind = EntityKind::$kind;
            const STATE_KIND: StateKind = StateKind::$state;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

macro_rules! derived_record {
    ($ty:ty) => {
        impl DerivedRecord for $ty {
            fn fresh(id: EntityId, status: EntityStatus) -> Self {
                Self {
                    id,
                    status,
                    ..Default::default()
                }
            }

            fn status(&self) -> EntityStatus {
                self.status
            }

            fn set_status(&mut self, status: EntityStatus) {
                self.status = status;
            }

            fn error(&self) -> Option<&str> {
                self.error.as_deref()
            }

            fn set_error(&mut self, error: Option<String>) {
                self.error = error;
            }
        }
    };
}

/// One equal-width histogram bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub bucket: u32,
    pub low: f64,
    pub high: f64,
    pub count: u64,
}

/// Column profile produced by the profiling pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub null_count: u64,
    pub cardinality: Option<u64>,
    pub histogram: Option<Vec<HistogramBin>>,
}

/// How much of a profile was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProfileScope {
    /// Null counts and cardinality only.
    #[default]
    Summary,
    /// Summary plus numeric histograms.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SourceFormat {
    #[default]
    Csv,
    Tsv,
    Json,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" | "txt" => Some(Self::Tsv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentTable {
    pub id: EntityId,
    pub name: String,
    pub path: String,
    pub format: SourceFormat,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedTable {
    pub id: EntityId,
    pub status: EntityStatus,
    pub error: Option<String>,
    pub profile: Vec<ColumnSummary>,
    pub profile_scope: ProfileScope,
    pub cardinality: Option<u64>,
    pub size_bytes: Option<u64>,
    pub preview: Vec<Row>,
}

entity_record!(PersistentTable, Table, Persistent);
entity_record!(DerivedTable, Table, Derived);
derived_record!(DerivedTable);

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentModel {
    pub id: EntityId,
    pub name: String,
    pub query: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedModel {
    pub id: EntityId,
    pub status: EntityStatus,
    pub error: Option<String>,
    pub sanitized_query: String,
    pub profile: Vec<ColumnSummary>,
    pub profile_scope: ProfileScope,
    pub cardinality: Option<u64>,
    pub preview: Vec<Row>,
    /// Tables referenced by the query text that produced `profile`.
    pub sources: Vec<String>,
    pub export_path: Option<String>,
}

entity_record!(PersistentModel, Model, Persistent);
entity_record!(DerivedModel, Model, Derived);
derived_record!(DerivedModel);

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEntity {
    pub kind: EntityKind,
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistentApplication {
    pub id: EntityId,
    pub project_path: Option<String>,
    pub database_path: Option<String>,
    pub active_entity: Option<ActiveEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedApplication {
    pub id: EntityId,
    pub status: ApplicationStatus,
}

entity_record!(PersistentApplication, Application, Persistent);
entity_record!(DerivedApplication, Application, Derived);

// ---------------------------------------------------------------------------
// Metrics definitions, measures and dimensions
// ---------------------------------------------------------------------------

/// Granularity of a timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeGrain {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Suggested rollup for time series over a timestamp column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupInterval {
    pub grain: TimeGrain,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentMetricsDefinition {
    pub id: EntityId,
    pub name: String,
    pub model_id: EntityId,
    pub time_dimension: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetricsDefinition {
    pub id: EntityId,
    pub status: EntityStatus,
    pub error: Option<String>,
    pub smallest_time_grain: Option<TimeGrain>,
    pub rollup_interval: Option<RollupInterval>,
}

entity_record!(PersistentMetricsDefinition, MetricsDefinition, Persistent);
entity_record!(DerivedMetricsDefinition, MetricsDefinition, Derived);
derived_record!(DerivedMetricsDefinition);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentMeasure {
    pub id: EntityId,
    pub metrics_definition_id: EntityId,
    pub label: String,
    pub expression: String,
    pub sql_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMeasure {
    pub id: EntityId,
    pub status: EntityStatus,
    pub error: Option<String>,
    pub referenced_columns: Vec<String>,
    pub expression_is_valid: bool,
}

entity_record!(PersistentMeasure, Measure, Persistent);
entity_record!(DerivedMeasure, Measure, Derived);
derived_record!(DerivedMeasure);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentDimension {
    pub id: EntityId,
    pub metrics_definition_id: EntityId,
    pub label: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DerivedDimension {
    pub id: EntityId,
    pub status: EntityStatus,
    pub error: Option<String>,
    pub cardinality: Option<u64>,
}

entity_record!(PersistentDimension, Dimension, Persistent);
entity_record!(DerivedDimension, Dimension, Derived);
derived_record!(DerivedDimension);
