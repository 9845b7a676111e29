use serde::{Deserialize, Serialize};

use crate::actions::ActionEnvelope;
use crate::error::StoreError;
use crate::state::{
    EntityKind, EntityStateStore, Patch, PatchEvent, PatchOrigin, StateKind, StreamKey,
};

/// Ordered patches for one stream, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBatch {
    pub entity_kind: EntityKind,
    pub state_kind: StateKind,
    /// Sender's stream version after these patches. Batches without one are
    /// applied unconditionally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub patches: Vec<Patch>,
}

impl PatchBatch {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.entity_kind, self.state_kind)
    }

    pub fn from_event(event: &PatchEvent) -> Self {
        Self {
            entity_kind: event.stream.entity_kind,
            state_kind: event.stream.state_kind,
            version: Some(event.version),
            patches: event.patches.clone(),
        }
    }

    /// One whole-stream replacement carrying the current snapshot.
    pub fn resync(store: &EntityStateStore, stream: StreamKey) -> Self {
        let (version, entities) = store.versioned_snapshot(stream);
        Self {
            entity_kind: stream.entity_kind,
            state_kind: stream.state_kind,
            version: Some(version),
            patches: vec![Patch::replace_stream(entities)],
        }
    }

    /// Apply to `store`, dropping the batch if `origin` already delivered
    /// this stream version.
    pub fn apply(&self, store: &EntityStateStore, origin: PatchOrigin) -> Result<usize, StoreError> {
        match self.version {
            Some(version) => store.apply_versioned(self.stream(), version, &self.patches, origin),
            None => store.apply_patches(self.stream(), &self.patches, origin),
        }
    }
}

/// Every message exchanged between peers: `{action, args}` or
/// `{entityKind, stateKind, patches}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Dispatch(ActionEnvelope),
    Patches(PatchBatch),
}

impl WireMessage {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::Patches(_) => "patches",
        }
    }
}
