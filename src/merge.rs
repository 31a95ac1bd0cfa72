//! Path merge engine
//!
//! Turns an update request into the patch handed to `Backend::update_record`.
//! Only the top-level keys the request touches end up in the patch, so
//! field-level backends leave every other column alone.
//!
//! ## Shared top-level keys
//!
//! Nested writes are applied to a working copy of the record, so several
//! paths under one field accumulate: `["data.a", "data.b"]` yields both keys.
//! A whole-field write (`"data"`) only lands in the patch, though. If a later
//! entry writes below the same field (`"data.b"`), that field is re-derived
//! from the working copy and the earlier replacement is lost. Callers have
//! come to rely on this ordering, so it stays as is.

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::path::{set_in, unset_in, FieldPath};
use crate::record::{Patch, UserRecord, CREATED_AT_KEY, MUTABLE_FIELDS, UPDATED_AT_KEY, USER_ID_KEY};

/// Requested modification of one record
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Replace every listed top-level field
    Whole(Map<String, Value>),
    /// Set one value at a dotted path
    Path(FieldPath, Value),
    /// Set each value at the path with the same index
    Paths(Vec<(FieldPath, Value)>),
}

impl Change {
    pub fn whole(fields: Map<String, Value>) -> Self {
        Change::Whole(fields)
    }

    pub fn path(path: &str, value: Value) -> Result<Self, StoreError> {
        Ok(Change::Path(FieldPath::parse(path)?, value))
    }

    /// Pair parallel path and value lists
    pub fn paths<S: AsRef<str>>(paths: &[S], values: Vec<Value>) -> Result<Self, StoreError> {
        if paths.len() != values.len() {
            return Err(StoreError::InvalidPath(format!(
                "{} paths given for {} values",
                paths.len(),
                values.len()
            )));
        }
        let parsed = FieldPath::parse_all(paths)?;
        Ok(Change::Paths(parsed.into_iter().zip(values).collect()))
    }
}

fn check_field(path: &FieldPath) -> Result<(), StoreError> {
    if MUTABLE_FIELDS.contains(&path.top()) {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(format!(
            "{} does not address a writable field",
            path
        )))
    }
}

/// Compute the patch for `change` against `existing`
pub fn merge(existing: &UserRecord, change: &Change) -> Result<Patch, StoreError> {
    match change {
        Change::Whole(fields) => {
            let mut patch = Patch::new();
            for (key, value) in fields {
                if matches!(key.as_str(), USER_ID_KEY | CREATED_AT_KEY | UPDATED_AT_KEY) {
                    continue;
                }
                if !MUTABLE_FIELDS.contains(&key.as_str()) {
                    return Err(StoreError::InvalidPath(format!(
                        "{} is not a record field",
                        key
                    )));
                }
                patch.insert(key.clone(), value.clone());
            }
            Ok(patch)
        }
        Change::Path(path, value) => merge_paths(existing, std::iter::once((path, value))),
        Change::Paths(pairs) => merge_paths(existing, pairs.iter().map(|(p, v)| (p, v))),
    }
}

fn merge_paths<'a>(
    existing: &UserRecord,
    pairs: impl Iterator<Item = (&'a FieldPath, &'a Value)>,
) -> Result<Patch, StoreError> {
    let mut working = existing.to_map();
    let mut patch = Patch::new();

    for (path, value) in pairs {
        check_field(path)?;
        let key = path.top();
        if path.is_top_level() {
            patch.insert(key.to_string(), value.clone());
            continue;
        }
        let field = working.entry(key.to_string()).or_insert(Value::Null);
        set_in(field, path.rest(), value.clone())?;
        patch.insert(key.to_string(), field.clone());
    }

    Ok(patch)
}

/// Patch removing `path` from `existing`
///
/// Nested paths drop the leaf from a copy of their field; a top-level path
/// resets the field to the value a new record starts with. The flag reports
/// whether the record actually held something at `path`.
pub fn delete_patch(
    existing: &UserRecord,
    path: &FieldPath,
    default_name: &str,
) -> Result<(Patch, bool), StoreError> {
    check_field(path)?;
    let key = path.top();
    let mut patch = Patch::new();

    if path.is_top_level() {
        let reset = UserRecord::default_field(key, default_name)
            .ok_or_else(|| StoreError::InvalidPath(format!("{} cannot be reset", path)))?;
        patch.insert(key.to_string(), reset);
        return Ok((patch, true));
    }

    let mut field = existing.to_map().remove(key).unwrap_or(Value::Null);
    let removed = unset_in(&mut field, path.rest());
    patch.insert(key.to_string(), field);
    Ok((patch, removed))
}
