//! Object versions
//!
//! A `Version` is the delta one transaction produced for one object: the
//! fields it touched and whether it reset the object first. Versions are
//! layered newest-over-oldest to compute what a transaction observes, and
//! combined pairwise when adjacent version maps are merged.
//!
//! ## Merge contract
//!
//! `newer.merge_older(&older)` yields a version observably equivalent to
//! applying `older` then `newer`:
//! - every field `newer` touched keeps `newer`'s value
//! - fields only `older` touched carry over, unless `newer` cleared the object
//! - if `older` cleared the object, the combined delta clears it too

use crate::types::ObjectId;
use crate::value::Value;
use std::collections::BTreeMap;

/// State of one field in one version layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldState<'a> {
    /// Layer wrote this value
    Set(&'a Value),
    /// Layer removed the field (explicitly or by clearing the object)
    Removed,
    /// Layer did not touch the field; look at older layers
    Untouched,
}

/// Delta produced by one transaction for one object
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    object: ObjectId,
    cleared: bool,
    fields: BTreeMap<String, Value>,
}

impl Version {
    /// Empty delta for `object`
    pub fn new(object: ObjectId) -> Self {
        Version {
            object,
            cleared: false,
            fields: BTreeMap::new(),
        }
    }

    /// Object this version belongs to
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Whether this version reset the object before applying its fields
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Whether the version carries no change at all
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.fields.is_empty()
    }

    /// Number of touched fields
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Write a field
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field
    pub fn remove(&mut self, field: impl Into<String>) {
        self.fields.insert(field.into(), Value::Null);
    }

    /// Reset the object; earlier field writes of this version are dropped
    pub fn clear(&mut self) {
        self.cleared = true;
        self.fields.clear();
    }

    /// What this layer says about `field`
    pub fn field(&self, field: &str) -> FieldState<'_> {
        match self.fields.get(field) {
            Some(Value::Null) => FieldState::Removed,
            Some(v) => FieldState::Set(v),
            None if self.cleared => FieldState::Removed,
            None => FieldState::Untouched,
        }
    }

    /// Touched fields in name order (removals appear as `Value::Null`)
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fold an older delta of the same object under this one
    pub fn merge_older(&mut self, older: &Version) {
        debug_assert_eq!(self.object, older.object);
        if self.cleared {
            return;
        }
        for (k, v) in &older.fields {
            self.fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if older.cleared {
            self.cleared = true;
        }
    }

    /// Resolved field values with removals dropped
    pub fn live_fields(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
