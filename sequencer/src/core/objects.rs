//! Named simulation objects the loop body reads and mutates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::error::ControlError;

/// Parameter values keyed by `name` or `Object.Field`.
pub type ObjectValues = BTreeMap<String, f64>;

/// Fields every spacecraft starts with.
const SPACECRAFT_FIELDS: [&str; 7] = ["X", "Y", "Z", "VX", "VY", "VZ", "DryMass"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Scalar user variable.
    Variable,
    /// Record of named scalar fields addressed as `Sat.Field`.
    Spacecraft,
}

/// Declared objects plus their current parameter values.
///
/// Only `values` is mutated by worker commands, so only `values` is captured
/// by a loop snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStore {
    kinds: BTreeMap<String, ObjectKind>,
    values: ObjectValues,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an object. Returns false if the name is already taken.
    pub fn declare(&mut self, name: &str, kind: ObjectKind) -> bool {
        if self.kinds.contains_key(name) {
            return false;
        }
        self.kinds.insert(name.to_string(), kind);
        match kind {
            ObjectKind::Variable => {
                self.values.insert(name.to_string(), 0.0);
            }
            ObjectKind::Spacecraft => {
                for field in SPACECRAFT_FIELDS {
                    self.values.insert(format!("{name}.{field}"), 0.0);
                }
            }
        }
        true
    }

    pub fn kind(&self, name: &str) -> Option<ObjectKind> {
        self.kinds.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<f64, ControlError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ControlError::UnknownObject {
                name: name.to_string(),
            })
    }

    /// Set a parameter. Spacecraft may grow new fields; bare names must be
    /// declared variables.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ControlError> {
        let owner = name.split_once('.').map_or(name, |(owner, _)| owner);
        match (self.kinds.get(owner), name.contains('.')) {
            (Some(ObjectKind::Variable), false) | (Some(ObjectKind::Spacecraft), true) => {
                self.values.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(ControlError::UnknownObject {
                name: name.to_string(),
            }),
        }
    }

    pub fn values(&self) -> &ObjectValues {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacecraft_fields_are_addressable() {
        let mut store = ObjectStore::new();
        assert!(store.declare("Sat", ObjectKind::Spacecraft));
        store.set("Sat.X", 7000.0).expect("set");
        store.set("Sat.Epoch", 1.5).expect("new field");
        assert_eq!(store.get("Sat.X").expect("get"), 7000.0);
        assert_eq!(store.get("Sat.Epoch").expect("get"), 1.5);
    }

    #[test]
    fn undeclared_names_are_rejected() {
        let mut store = ObjectStore::new();
        store.declare("v", ObjectKind::Variable);
        assert!(store.set("w", 1.0).is_err());
        assert!(store.set("v.X", 1.0).is_err());
        assert!(store.get("w").is_err());
    }

    #[test]
    fn redeclaration_is_refused() {
        let mut store = ObjectStore::new();
        assert!(store.declare("v", ObjectKind::Variable));
        assert!(!store.declare("v", ObjectKind::Spacecraft));
    }
}
