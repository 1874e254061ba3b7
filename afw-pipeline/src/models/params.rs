//! Stage parameter envelope
//!
//! Stages are registered dynamically, so parameters travel as a versioned
//! key/value envelope rather than a per-stage struct. The canonical JSON form
//! (keys sorted at every depth) is what gets persisted and what the
//! idempotency key digests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Current envelope schema version
pub const PARAMS_SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    PARAMS_SCHEMA_VERSION
}

/// Versioned, serializable parameter bag handed to a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    #[serde(rename = "v", default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            version: PARAMS_SCHEMA_VERSION,
            values: BTreeMap::new(),
        }
    }
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Build from a JSON value; `null` means no parameters
    pub fn from_json_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self {
                version: PARAMS_SCHEMA_VERSION,
                values: map.into_iter().collect(),
            }),
            other => Err(format!("params must be a JSON object, got {}", json_kind(&other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Deterministic serialization: same logical params, same bytes
    pub fn canonical_json(&self) -> String {
        let values: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), canonical_value(v)))
            .collect();

        let mut envelope = Map::new();
        envelope.insert("v".to_string(), Value::from(self.version));
        envelope.insert("values".to_string(), Value::Object(values));
        Value::Object(envelope).to_string()
    }

    /// Parse a stored envelope
    pub fn from_stored(json: &str) -> serde_json::Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json)
    }
}

/// Rebuild objects with keys inserted in sorted order so the output is
/// sorted whether or not serde_json preserves insertion order.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical_value(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
