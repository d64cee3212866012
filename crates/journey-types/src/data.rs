//! The data bag: namespaced key-value store carried in journey state.
//!
//! Paths are dotted strings whose first segment names a [`DataArea`]
//! (`scenario.title`, `planning.shots`, `video.settings.aspect_ratio`).
//! Content producers write into the bag through engine actions; the
//! validator only reads from it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{EngineError, Result};

/// Top-level partition of the data bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataArea {
    Auth,
    Scenario,
    Planning,
    Video,
    Feedback,
    Project,
}

impl DataArea {
    pub const ALL: [DataArea; 6] = [
        DataArea::Auth,
        DataArea::Scenario,
        DataArea::Planning,
        DataArea::Video,
        DataArea::Feedback,
        DataArea::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataArea::Auth => "auth",
            DataArea::Scenario => "scenario",
            DataArea::Planning => "planning",
            DataArea::Video => "video",
            DataArea::Feedback => "feedback",
            DataArea::Project => "project",
        }
    }
}

impl fmt::Display for DataArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataArea {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        DataArea::ALL
            .iter()
            .copied()
            .find(|area| area.as_str() == s)
            .ok_or_else(|| EngineError::InvalidDataPath {
                path: s.to_string(),
                message: "unknown data area".into(),
            })
    }
}

/// Namespaced data store partitioned by [`DataArea`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag {
    areas: BTreeMap<DataArea, Map<String, Value>>,
}

/// Split a dotted path into its area and the remaining key segments.
fn split_path(path: &str) -> Result<(DataArea, Vec<&str>)> {
    let mut segments = path.split('.');
    let area = segments.next().unwrap_or_default().parse::<DataArea>().map_err(|_| {
        EngineError::InvalidDataPath {
            path: path.to_string(),
            message: "first segment must name a data area".into(),
        }
    })?;
    let keys: Vec<&str> = segments.collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(EngineError::InvalidDataPath {
            path: path.to_string(),
            message: "empty path segment".into(),
        });
    }
    Ok((area, keys))
}

/// Recursively merge `patch` into `target`. Objects merge key by key; any
/// other value replaces what was there.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// `true` for null, blank strings, empty arrays and empty objects.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by dotted path. A bare area name has no value.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (area, keys) = split_path(path).ok()?;
        let (first, rest) = keys.split_first()?;
        let mut current = self.areas.get(&area)?.get(*first)?;
        for key in rest {
            current = match current {
                Value::Object(map) => map.get(*key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// `true` when the path resolves to a non-empty value.
    pub fn is_present(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !is_empty_value(v))
    }

    /// String form of the value at `path`, used by guard conditions.
    /// Missing and null values resolve to an empty string.
    pub fn resolve_string(&self, path: &str) -> String {
        match self.get(path) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Deep-merge `value` at `path`, creating intermediate objects. Existing
    /// non-object values along the path are never overwritten.
    ///
    /// A path naming only an area requires an object value, which is merged
    /// into that area.
    pub fn merge(&mut self, path: &str, value: Value) -> Result<()> {
        let (area, keys) = split_path(path)?;
        let Some((last, parents)) = keys.split_last() else {
            return self.merge_area(area, value);
        };
        let mut cursor = self.areas.entry(area).or_default();
        for key in parents {
            let slot = cursor
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(inner) = slot else {
                return Err(EngineError::InvalidDataPath {
                    path: path.to_string(),
                    message: format!("'{key}' is not an object"),
                });
            };
            cursor = inner;
        }
        match cursor.get_mut(*last) {
            Some(existing) => deep_merge(existing, value),
            None => {
                cursor.insert(last.to_string(), value);
            }
        }
        Ok(())
    }

    /// Deep-merge an object into a whole area.
    pub fn merge_area(&mut self, area: DataArea, value: Value) -> Result<()> {
        let Value::Object(incoming) = value else {
            return Err(EngineError::InvalidDataPath {
                path: area.to_string(),
                message: "only objects can be merged into a data area".into(),
            });
        };
        let map = self.areas.entry(area).or_default();
        let mut wrapped = Value::Object(std::mem::take(map));
        deep_merge(&mut wrapped, Value::Object(incoming));
        if let Value::Object(merged) = wrapped {
            *map = merged;
        }
        Ok(())
    }

    pub fn area(&self, area: DataArea) -> Option<&Map<String, Value>> {
        self.areas.get(&area)
    }

    pub fn is_empty(&self) -> bool {
        self.areas.values().all(|m| m.is_empty())
    }

    pub fn clear(&mut self) {
        self.areas.clear();
    }
}
