//! In-memory datapoint store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::registers::RegisterMap;
use crate::value::{Value, ValueKind};

/// Last known state of one datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub value: Value,
    /// Fixed for the lifetime of the store.
    pub kind: ValueKind,
    /// `None` until the first `set`.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Datapoint {
    fn unknown(kind: ValueKind) -> Self {
        Self {
            value: Value::Unknown,
            kind,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{group}/{key} holds {expected} values")]
pub struct KindMismatch {
    pub group: String,
    pub key: String,
    pub expected: ValueKind,
}

/// Mapping from `(group, key)` to the current [`Datapoint`].
///
/// Never performs I/O; a lookup returns the last known value.
#[derive(Debug, Default)]
pub struct DatapointStore {
    groups: HashMap<String, HashMap<String, Datapoint>>,
}

impl DatapointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with every mapped register pre-populated as `Unknown`.
    pub fn from_map(map: &RegisterMap) -> Self {
        let mut store = Self::new();
        for group in map.groups() {
            for register in group.registers() {
                store.declare(group.name, register.key, register.kind());
            }
        }
        store
    }

    /// Add an `Unknown` datapoint of the given kind. Existing entries are kept.
    pub fn declare(&mut self, group: &str, key: &str, kind: ValueKind) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Datapoint::unknown(kind));
    }

    pub fn get(&self, group: &str, key: &str) -> Value {
        self.datapoint(group, key)
            .map(|point| point.value.clone())
            .unwrap_or_default()
    }

    pub fn datapoint(&self, group: &str, key: &str) -> Option<&Datapoint> {
        self.groups.get(group).and_then(|points| points.get(key))
    }

    /// Update a datapoint and its timestamp, returning whether the value changed.
    ///
    /// Unknown datapoints are created with the kind of the first known value.
    /// Setting `Unknown` is always accepted.
    pub fn set(&mut self, group: &str, key: &str, value: Value) -> Result<bool, KindMismatch> {
        let points = self.groups.entry(group.to_string()).or_default();

        if !points.contains_key(key) {
            let Some(kind) = value.kind() else {
                return Ok(false);
            };
            points.insert(key.to_string(), Datapoint::unknown(kind));
        }
        let Some(point) = points.get_mut(key) else {
            return Ok(false);
        };

        if let Some(kind) = value.kind() {
            if kind != point.kind {
                return Err(KindMismatch {
                    group: group.to_string(),
                    key: key.to_string(),
                    expected: point.kind,
                });
            }
        }

        let changed = point.value != value;
        point.value = value;
        point.updated_at = Some(Utc::now());
        Ok(changed)
    }

    /// Snapshot of a group, ordered by key.
    pub fn all_in_group(&self, group: &str) -> BTreeMap<String, Value> {
        self.groups
            .get(group)
            .map(|points| {
                points
                    .iter()
                    .map(|(key, point)| (key.clone(), point.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
