//! Run-scoped variable store.
//!
//! A flat key/value environment with `{key}` template expansion and
//! sensitive-key redaction. The store deliberately has no inherited keys and
//! refuses writes to names that would be prototype-pollution vectors in the
//! flow authoring surface.

use std::collections::{BTreeMap, HashSet};

use flowpilot_flow_model::Variable;
use serde_json::{Map, Value};
use tracing::warn;

/// Keys that are never accepted as variable names.
const DENIED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

#[derive(Clone, Debug, Default)]
pub struct VarStore {
    values: BTreeMap<String, Value>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from declared defaults, then let caller-supplied args override.
    pub fn from_declarations(declared: &[Variable], args: &Map<String, Value>) -> Self {
        let mut store = Self::new();
        for variable in declared {
            if let Some(default) = &variable.default {
                store.set(&variable.key, default.clone());
            }
        }
        for (key, value) in args {
            store.set(key, value.clone());
        }
        store
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if DENIED_KEYS.contains(&key) {
            warn!(key, "rejecting dangerous variable key");
            return;
        }
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Whether the key holds a usable (non-null, non-empty-string) value.
    pub fn has_value(&self, key: &str) -> bool {
        match self.values.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Expand `{key}` references against the current snapshot. Missing keys
    /// expand to the empty string, matching the recorder's template rules.
    pub fn expand_str(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    out.push_str(&self.value_as_text(key));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Recursive template expansion through nested structures.
    pub fn expand_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.expand_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.expand_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expand_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Copy fields of a step result into variables: `save_as` stores the
    /// whole result, `assign` maps result fields to variable names.
    pub fn apply_result(
        &mut self,
        save_as: Option<&(String, Value)>,
        assign: &[(String, Value)],
    ) {
        if let Some((key, value)) = save_as {
            self.set(key, value.clone());
        }
        for (key, value) in assign {
            self.set(key, value.clone());
        }
    }

    /// Snapshot with every declared-sensitive key excluded, regardless of how
    /// its value was set.
    pub fn redacted_snapshot(&self, sensitive: &HashSet<String>) -> Map<String, Value> {
        self.values
            .iter()
            .filter(|(key, _)| !sensitive.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn value_as_text(&self, key: &str) -> String {
        match self.values.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}
