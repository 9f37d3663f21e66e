//! Insurance claim payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field used as the claim identifier when present
pub const CLAIM_ID_FIELD: &str = "PolicyNumber";

/// A raw insurance claim: field name to raw value.
///
/// Claims arrive schema-less; the preprocessing schema decides which fields
/// are read and how they are typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claim(Map<String, Value>);

impl Claim {
    /// Create an empty claim
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field insertion
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Raw value of a field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Whether the claim carries the field at all (a JSON null counts)
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Iterate over all fields
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identifier taken from the policy number, if the claim has one
    pub fn claim_id(&self) -> Option<String> {
        self.0.get(CLAIM_ID_FIELD).map(render_value)
    }

    /// Raw value rendered for humans (strings unquoted, missing as "null")
    pub fn display_value(&self, field: &str) -> String {
        self.0.get(field).map(render_value).unwrap_or_else(|| "null".to_string())
    }

    /// Compact JSON rendering used inside prompts and retrieval queries
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for Claim {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
