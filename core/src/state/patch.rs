//! Structural patches between two snapshots of a stream.
//!
//! Paths address entities by id, never by position:
//!
//! * `""`             the whole stream (replace only, value is the entity array)
//! * `/<id>`          one entity (add / replace / remove)
//! * `/<id>/<field>`  one top-level field of an entity (replace / remove)
//!
//! Id-keyed paths make application idempotent: re-applying a patch the store
//! already reflects changes nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Parsed form of a patch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchTarget {
    Stream,
    Entity(String),
    Field(String, String),
}

impl Patch {
    pub fn add(id: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: entity_path(id),
            value: Some(value),
        }
    }

    pub fn replace_field(id: &str, field: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: format!("{}/{}", entity_path(id), escape(field)),
            value: Some(value),
        }
    }

    pub fn remove_field(id: &str, field: &str) -> Self {
        Self {
            op: PatchOp::Remove,
            path: format!("{}/{}", entity_path(id), escape(field)),
            value: None,
        }
    }

    /// Tombstone for a deleted entity.
    pub fn remove(id: &str) -> Self {
        Self {
            op: PatchOp::Remove,
            path: entity_path(id),
            value: None,
        }
    }

    /// Replace an entire stream; used for full resyncs.
    pub fn replace_stream(entities: Vec<Value>) -> Self {
        Self {
            op: PatchOp::Replace,
            path: String::new(),
            value: Some(Value::Array(entities)),
        }
    }

    pub fn target(&self) -> Result<PatchTarget, StoreError> {
        if self.path.is_empty() {
            return Ok(PatchTarget::Stream);
        }
        let rest = self
            .path
            .strip_prefix('/')
            .ok_or_else(|| StoreError::InvalidPath(self.path.clone()))?;
        let mut parts = rest.split('/');
        let id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::InvalidPath(self.path.clone()))?;
        match (parts.next(), parts.next()) {
            (None, _) => Ok(PatchTarget::Entity(unescape(id))),
            (Some(field), None) if !field.is_empty() => {
                Ok(PatchTarget::Field(unescape(id), unescape(field)))
            }
            _ => Err(StoreError::InvalidPath(self.path.clone())),
        }
    }

    fn required_value(&self) -> Result<&Value, StoreError> {
        self.value.as_ref().ok_or_else(|| StoreError::MissingValue {
            path: self.path.clone(),
        })
    }
}

fn entity_path(id: &str) -> String {
    format!("/{}", escape(id))
}

// JSON pointer escaping.
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

pub(crate) fn entity_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Diff two snapshots of the same stream.
///
/// New entities become `add`, changed entities one `replace` (or field
/// `remove`) per differing top-level field, vanished entities `remove`.
/// Patches follow the order of `new`, removals last.
pub fn diff_entities(old: &[Value], new: &[Value]) -> Vec<Patch> {
    let old_by_id: HashMap<&str, &Value> = old
        .iter()
        .filter_map(|v| entity_id(v).map(|id| (id, v)))
        .collect();
    let new_ids: HashMap<&str, ()> = new
        .iter()
        .filter_map(|v| entity_id(v).map(|id| (id, ())))
        .collect();

    let mut patches = Vec::new();

    for entity in new {
        let Some(id) = entity_id(entity) else {
            continue;
        };
        match old_by_id.get(id) {
            None => patches.push(Patch::add(id, entity.clone())),
            Some(prev) if *prev == entity => {}
            Some(prev) => diff_fields(id, prev, entity, &mut patches),
        }
    }

    for entity in old {
        if let Some(id) = entity_id(entity) {
            if !new_ids.contains_key(id) {
                patches.push(Patch::remove(id));
            }
        }
    }

    patches
}

fn diff_fields(id: &str, prev: &Value, next: &Value, patches: &mut Vec<Patch>) {
    match (prev.as_object(), next.as_object()) {
        (Some(prev_obj), Some(next_obj)) => {
            for (field, value) in next_obj {
                if prev_obj.get(field) != Some(value) {
                    patches.push(Patch::replace_field(id, field, value.clone()));
                }
            }
            for field in prev_obj.keys() {
                if !next_obj.contains_key(field) {
                    patches.push(Patch::remove_field(id, field));
                }
            }
        }
        _ => patches.push(Patch::add(id, next.clone())),
    }
}

/// Apply one patch. Returns whether the stream changed.
pub fn apply_patch(entities: &mut Vec<Value>, patch: &Patch) -> Result<bool, StoreError> {
    match (patch.op, patch.target()?) {
        (PatchOp::Replace, PatchTarget::Stream) => {
            let next = match patch.required_value()? {
                Value::Array(items) => items.clone(),
                _ => return Err(StoreError::InvalidPath(patch.path.clone())),
            };
            if *entities == next {
                return Ok(false);
            }
            *entities = next;
            Ok(true)
        }
        (_, PatchTarget::Stream) => Err(StoreError::InvalidPath(patch.path.clone())),
        (PatchOp::Add | PatchOp::Replace, PatchTarget::Entity(id)) => {
            let value = patch.required_value()?;
            match position(entities, &id) {
                Some(idx) if entities[idx] == *value => Ok(false),
                Some(idx) => {
                    entities[idx] = value.clone();
                    Ok(true)
                }
                None => {
                    entities.push(value.clone());
                    Ok(true)
                }
            }
        }
        (PatchOp::Remove, PatchTarget::Entity(id)) => match position(entities, &id) {
            Some(idx) => {
                entities.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        },
        (op, PatchTarget::Field(id, field)) => {
            let Some(idx) = position(entities, &id) else {
                tracing::debug!(path = %patch.path, "patch targets a missing entity, skipped");
                return Ok(false);
            };
            let Some(obj) = entities[idx].as_object_mut() else {
                return Err(StoreError::InvalidPath(patch.path.clone()));
            };
            match op {
                PatchOp::Remove => Ok(obj.remove(&field).is_some()),
                PatchOp::Add | PatchOp::Replace => {
                    let value = patch.required_value()?;
                    if obj.get(&field) == Some(value) {
                        return Ok(false);
                    }
                    obj.insert(field, value.clone());
                    Ok(true)
                }
            }
        }
    }
}

fn position(entities: &[Value], id: &str) -> Option<usize> {
    entities.iter().position(|v| entity_id(v) == Some(id))
}
