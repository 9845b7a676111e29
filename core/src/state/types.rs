//! Entity and stream identifiers shared by every state record.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type EntityId = String;

/// Allocate a fresh entity id. Ids are never reused.
pub fn new_entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}

/// Kinds of tracked entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Table,
    Model,
    Application,
    MetricsDefinition,
    Measure,
    Dimension,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Table,
        EntityKind::Model,
        EntityKind::Application,
        EntityKind::MetricsDefinition,
        EntityKind::Measure,
        EntityKind::Dimension,
    ];

    /// snake_case form used in state file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Model => "model",
            Self::Application => "application",
            Self::MetricsDefinition => "metrics_definition",
            Self::Measure => "measure",
            Self::Dimension => "dimension",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two parallel views every entity exists in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateKind {
    /// User-authored, file-backed facts.
    Persistent,
    /// Facts computed by query execution.
    Derived,
}

impl StateKind {
    pub const ALL: [StateKind; 2] = [StateKind::Persistent, StateKind::Derived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Derived => "derived",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (entity kind, state kind) stream. Patches are totally ordered per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub entity_kind: EntityKind,
    pub state_kind: StateKind,
}

impl StreamKey {
    pub const fn new(entity_kind: EntityKind, state_kind: StateKind) -> Self {
        Self {
            entity_kind,
            state_kind,
        }
    }

    /// Every stream, in a stable order.
    pub fn all() -> impl Iterator<Item = StreamKey> {
        EntityKind::ALL.into_iter().flat_map(|kind| {
            StateKind::ALL
                .into_iter()
                .map(move |state| StreamKey::new(kind, state))
        })
    }

    /// `persistent_table_state.json` and friends.
    pub fn file_name(&self) -> String {
        format!("{self}_state.json")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.state_kind, self.entity_kind)
    }
}

/// Lifecycle status carried on every derived record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum EntityStatus {
    #[default]
    Idle,
    Importing,
    Validating,
    Profiling,
    Exporting,
    Error,
}

impl EntityStatus {
    /// Busy statuses keep the application in `Running`.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Importing | Self::Validating | Self::Profiling | Self::Exporting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Importing => "importing",
            Self::Validating => "validating",
            Self::Profiling => "profiling",
            Self::Exporting => "exporting",
            Self::Error => "error",
        }
    }
}

/// Process-wide status held on the application's derived record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ApplicationStatus {
    #[default]
    Idle,
    Running,
}

/// Where a batch of patches came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatchOrigin {
    /// Produced by a mutation in this process.
    Local,
    /// Applied from a remote peer, identified by its link id.
    Remote(String),
}
