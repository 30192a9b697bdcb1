//! Patch application over JSON documents.
//!
//! A patch names an operation, a `/`-delimited path and a value. Applying
//! one is a pure function: the input document is never mutated, and any
//! error leaves the caller holding the unchanged original. Path segments are
//! taken literally; an empty terminal segment addresses the container
//! itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single mutation to apply to a document body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    pub value: Value,
}

/// The supported patch operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Add a key to an object; succeeds without change when the key exists.
    ObjectAdd,
    /// Append the value to the addressed array.
    ArrayAdd,
    /// Remove the first element of the addressed array that is structurally
    /// equal to the value; succeeds without change when none matches.
    ArrayRemove,
}

/// Result reported for a whole patch batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub uri: String,
    #[serde(rename = "patchFailed")]
    pub patch_failed: bool,
    pub message: String,
}

impl PatchOutcome {
    pub fn success(uri: impl Into<String>) -> Self {
        PatchOutcome {
            uri: uri.into(),
            patch_failed: false,
            message: "patches applied".to_string(),
        }
    }

    pub fn failure(uri: impl Into<String>, message: impl Into<String>) -> Self {
        PatchOutcome {
            uri: uri.into(),
            patch_failed: true,
            message: message.into(),
        }
    }
}

/// Why a single patch could not be applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("missing leading slash")]
    MissingLeadingSlash,

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("invalid array index {0}")]
    InvalidIndex(String),

    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("path ends at an array index")]
    EndsInArray,

    #[error("cannot patch through a {0}")]
    Unpatchable(&'static str),

    #[error("operation does not apply at this path")]
    InvalidOperation,
}

/// Apply one patch to a document, returning the patched copy.
pub fn apply_patch(doc: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let Some(rest) = patch.path.strip_prefix('/') else {
        return Err(PatchError::MissingLeadingSlash);
    };
    let segments: Vec<&str> = rest.split('/').collect();
    apply_at(doc, &segments, patch)
}

fn apply_at(value: &Value, segments: &[&str], patch: &Patch) -> Result<Value, PatchError> {
    match value {
        Value::Object(map) => apply_to_object(map, segments, patch),
        Value::Array(items) => apply_to_array(items, segments, patch),
        Value::Bool(_) => Err(PatchError::Unpatchable("boolean")),
        Value::Number(_) => Err(PatchError::Unpatchable("number")),
        Value::String(_) => Err(PatchError::Unpatchable("string")),
        Value::Null => Err(PatchError::Unpatchable("null")),
    }
}

fn apply_to_object(
    map: &Map<String, Value>,
    segments: &[&str],
    patch: &Patch,
) -> Result<Value, PatchError> {
    let (target, rest) = match segments {
        [] => ("", &[][..]),
        [target, rest @ ..] => (*target, rest),
    };

    if rest.is_empty() && patch.op == PatchOp::ObjectAdd {
        if map.contains_key(target) {
            // Adding over an existing key is a no-op, not a failure.
            return Ok(Value::Object(map.clone()));
        }
        let mut out = map.clone();
        out.insert(target.to_string(), patch.value.clone());
        return Ok(Value::Object(out));
    }

    match map.get(target) {
        None => Err(PatchError::KeyNotFound(target.to_string())),
        Some(child) => {
            let updated = apply_at(child, rest, patch)?;
            let mut out = map.clone();
            out.insert(target.to_string(), updated);
            Ok(Value::Object(out))
        }
    }
}

fn apply_to_array(items: &[Value], segments: &[&str], patch: &Patch) -> Result<Value, PatchError> {
    if matches!(segments, [] | [""]) {
        // The path addressed this array itself.
        return match patch.op {
            PatchOp::ArrayAdd => {
                let mut out = items.to_vec();
                out.push(patch.value.clone());
                Ok(Value::Array(out))
            }
            PatchOp::ArrayRemove => {
                let mut out = items.to_vec();
                if let Some(pos) = out.iter().position(|v| *v == patch.value) {
                    out.remove(pos);
                }
                Ok(Value::Array(out))
            }
            PatchOp::ObjectAdd => Err(PatchError::InvalidOperation),
        };
    }

    let (segment, rest) = (segments[0], &segments[1..]);
    let index: usize = segment
        .parse()
        .map_err(|_| PatchError::InvalidIndex(segment.to_string()))?;
    if index >= items.len() {
        return Err(PatchError::IndexOutOfBounds {
            index,
            len: items.len(),
        });
    }
    if rest.is_empty() {
        return Err(PatchError::EndsInArray);
    }

    let updated = apply_at(&items[index], rest, patch)?;
    let mut out = items.to_vec();
    out[index] = updated;
    Ok(Value::Array(out))
}
