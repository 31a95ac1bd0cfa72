//! Dotted field paths (`settings.theme`, `data.items.0`)

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Deepest path accepted
pub const MAX_DEPTH: usize = 64;

/// Slots an index may reach past the end of an existing array
pub const MAX_INDEX_GAP: usize = 256;

/// Validated dotted path into a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidPath("path must not be empty".into()));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidPath(format!(
                "path {:?} has an empty segment",
                path
            )));
        }
        if segments.len() > MAX_DEPTH {
            return Err(StoreError::InvalidPath(format!(
                "path has {} segments, at most {} allowed",
                segments.len(),
                MAX_DEPTH
            )));
        }
        Ok(Self { segments })
    }

    pub fn parse_all<S: AsRef<str>>(paths: &[S]) -> Result<Vec<Self>, StoreError> {
        paths.iter().map(|p| Self::parse(p.as_ref())).collect()
    }

    /// First segment: the record field the path lives under
    pub fn top(&self) -> &str {
        &self.segments[0]
    }

    /// Segments below the top-level field
    pub fn rest(&self) -> &[String] {
        &self.segments[1..]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_top_level(&self) -> bool {
        self.segments.len() == 1
    }

    /// Resolve against a value, `None` when any segment is missing
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        get_in(root, &self.segments)
    }
}

impl FromStr for FieldPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

fn index_of(segment: &str) -> Option<usize> {
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

pub(crate) fn get_in<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => index_of(segment).and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set `value` at `segments` below `target`, creating containers on the way.
///
/// Missing or scalar intermediates become arrays when the next segment is an
/// index and objects otherwise. An index may reach at most `MAX_INDEX_GAP`
/// slots past the end of an array.
pub(crate) fn set_in(target: &mut Value, segments: &[String], value: Value) -> Result<(), StoreError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    if let Value::Array(items) = target {
        if let Some(i) = index_of(segment) {
            if items.len() <= i {
                let len = i
                    .checked_add(1)
                    .filter(|len| *len <= items.len() + MAX_INDEX_GAP)
                    .ok_or_else(|| {
                        StoreError::InvalidPath(format!(
                            "index {} is too far past the end of an array of {}",
                            segment,
                            items.len()
                        ))
                    })?;
                items.resize(len, Value::Null);
            }
            return set_in(&mut items[i], rest, value);
        }
    }

    if !target.is_object() {
        *target = if index_of(segment).is_some() {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
        return set_in(target, segments, value);
    }

    if let Value::Object(map) = target {
        let slot = map.entry(segment.clone()).or_insert(Value::Null);
        if rest.is_empty() {
            *slot = value;
        } else {
            return set_in(slot, rest, value);
        }
    }
    Ok(())
}

/// Remove the leaf at `segments`, returning whether anything was removed
pub(crate) fn unset_in(target: &mut Value, segments: &[String]) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return match target {
            Value::Object(map) => map.shift_remove(segment).is_some(),
            Value::Array(items) => match index_of(segment) {
                // Arrays keep their length; the slot is emptied
                Some(i) if i < items.len() => {
                    items[i] = Value::Null;
                    true
                }
                _ => false,
            },
            _ => false,
        };
    }
    let child = match target {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => index_of(segment).and_then(|i| items.get_mut(i)),
        _ => None,
    };
    child.map(|c| unset_in(c, rest)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(path: &str) -> Vec<String> {
        FieldPath::parse(path).unwrap().segments().to_vec()
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(FieldPath::parse("settings.theme").is_ok());
        assert!(matches!(FieldPath::parse(""), Err(StoreError::InvalidPath(_))));
        assert!(matches!(FieldPath::parse("data..a"), Err(StoreError::InvalidPath(_))));
        assert!(matches!(FieldPath::parse(".data"), Err(StoreError::InvalidPath(_))));
    }

    #[test]
    fn test_get() {
        let value = json!({"data": {"items": [10, {"x": true}]}});
        let path = FieldPath::parse("data.items.1.x").unwrap();
        assert_eq!(path.get(&value), Some(&json!(true)));
        assert_eq!(FieldPath::parse("data.nope").unwrap().get(&value), None);
        assert_eq!(FieldPath::parse("data.items.9").unwrap().get(&value), None);
    }

    #[test]
    fn test_set_creates_containers() {
        let mut value = json!({});
        set_in(&mut value, &segs("a.b.c"), json!(1)).unwrap();
        assert_eq!(value, json!({"a": {"b": {"c": 1}}}));

        let mut value = json!({"list": null});
        set_in(&mut value, &segs("list.2"), json!("z")).unwrap();
        assert_eq!(value, json!({"list": [null, null, "z"]}));

        let mut value = json!({"a": 5});
        set_in(&mut value, &segs("a.b"), json!(1)).unwrap();
        assert_eq!(value, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_set_rejects_far_indexes() {
        for path in ["list.1000000000000", "list.18446744073709551615", "list.257"] {
            let mut value = json!({"list": []});
            assert!(
                matches!(set_in(&mut value, &segs(path), json!(1)), Err(StoreError::InvalidPath(_))),
                "{} should be rejected",
                path
            );
            assert_eq!(value, json!({"list": []}));
        }

        let mut value = json!({"list": [1]});
        set_in(&mut value, &segs("list.256"), json!(2)).unwrap();
        assert_eq!(value["list"].as_array().unwrap().len(), 257);
    }

    #[test]
    fn test_parse_rejects_deep_paths() {
        let deep = vec!["a"; MAX_DEPTH + 1].join(".");
        assert!(matches!(FieldPath::parse(&deep), Err(StoreError::InvalidPath(_))));
        assert!(FieldPath::parse(&vec!["a"; MAX_DEPTH].join(".")).is_ok());
    }

    #[test]
    fn test_unset() {
        let mut value = json!({"a": {"b": 1, "c": 2}, "l": [1, 2]});
        assert!(unset_in(&mut value, &segs("a.b")));
        assert!(!unset_in(&mut value, &segs("a.b")));
        assert!(unset_in(&mut value, &segs("l.0")));
        assert_eq!(value, json!({"a": {"c": 2}, "l": [null, 2]}));
    }
}
