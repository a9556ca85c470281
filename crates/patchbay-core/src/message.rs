use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::TransportError;

/// A structured control or event payload exchanged with the browser editor.
///
/// Always a JSON object on the wire. The relay never looks inside; engines
/// read the conventional `"type"` field to decide what a message means.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a message whose `"type"` field is `kind`.
    pub fn typed(kind: &str) -> Self {
        Self::new().with("type", kind)
    }

    /// Builder-style field insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.to_string(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The `"type"` field, when present and a string.
    pub fn message_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Serialize to JSON text for the wire.
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(&self.0).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// Parse one wire payload. Anything other than a JSON object is malformed.
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Self::try_from(value)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = TransportError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TransportError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
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
