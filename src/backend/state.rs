//! Persisted per-stage configuration.
//!
//! A [`WorkerState`] is a flat map of named optional values. Unset fields
//! fall back to a stage-defined default when first read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One persisted field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

/// Flat mapping of named, optionally-set fields for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    #[serde(default)]
    fields: BTreeMap<String, StateValue>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, name: &str) -> Option<StateValue> {
        self.fields.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: StateValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn unset(&mut self, name: &str) -> Option<StateValue> {
        self.fields.remove(name)
    }

    /// Numeric value; integers are widened.
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            StateValue::Float(v) => Some(v),
            StateValue::Int(v) => Some(v as f64),
            StateValue::Bool(_) => None,
        }
    }

    /// Integer value; floats are rounded.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            StateValue::Int(v) => Some(v),
            StateValue::Float(v) if v.is_finite() => Some(v.round() as i64),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            StateValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn float_or(&self, name: &str, default: f64) -> f64 {
        self.float(name).unwrap_or(default)
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.bool(name).unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StateValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_fields_fall_back() {
        let state = WorkerState::new();
        assert_eq!(state.float_or("face_coverage", 2.2), 2.2);
        assert!(state.bool_or("head_mode", true));
    }

    #[test]
    fn test_typed_accessors() {
        let mut state = WorkerState::new();
        state.set("resolution", StateValue::Int(224));
        state.set("coverage", StateValue::Float(2.5));
        state.set("flag", StateValue::Bool(true));

        assert_eq!(state.float("resolution"), Some(224.0));
        assert_eq!(state.int("coverage"), Some(3));
        assert_eq!(state.bool("flag"), Some(true));
        assert_eq!(state.float("flag"), None);
        assert_eq!(state.bool("resolution"), None);
    }

    #[test]
    fn test_json_round_trip_including_empty() {
        let empty = WorkerState::new();
        let json = serde_json::to_string(&empty).unwrap();
        assert_eq!(serde_json::from_str::<WorkerState>(&json).unwrap(), empty);

        let mut state = WorkerState::new();
        state.set("a", StateValue::Float(2.0));
        state.set("b", StateValue::Int(2));
        state.set("c", StateValue::Bool(false));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<WorkerState>(&json).unwrap(), state);
    }

    #[test]
    fn test_missing_fields_key_deserializes_empty() {
        let state: WorkerState = serde_json::from_str("{}").unwrap();
        assert!(state.is_empty());
    }

    use proptest::prelude::*;

    fn state_value() -> impl Strategy<Value = StateValue> {
        prop_oneof![
            (-1.0e9f64..1.0e9).prop_map(StateValue::Float),
            any::<i64>().prop_map(StateValue::Int),
            any::<bool>().prop_map(StateValue::Bool),
        ]
    }

    proptest! {
        #[test]
        fn test_store_load_round_trip(fields in prop::collection::btree_map("[a-z_]{1,12}", state_value(), 0..12)) {
            let mut state = WorkerState::new();
            for (k, v) in &fields {
                state.set(k.clone(), *v);
            }
            let json = serde_json::to_string(&state).unwrap();
            let loaded: WorkerState = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(loaded, state);
        }
    }
}
