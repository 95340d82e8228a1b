//! Minimal JSON document wrapper.

use serde_json::{Map, Value};

use crate::error::{CodecError, Result};

/// Name of the document id property.
pub const ID_FIELD: &str = "_id";

/// Name of the document revision property.
pub const REV_FIELD: &str = "_rev";

/// A JSON object whose top-level string properties can be read and replaced.
///
/// Nested content is kept as untyped [`Value`]s and passed through untouched,
/// so callers can store arbitrary documents while the client only looks at
/// `_id`, `_rev` and similar bookkeeping fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonDocument {
    data: Map<String, Value>,
}

impl JsonDocument {
    /// Create an empty document (`{}`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document from its JSON text. The text must encode an object.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Wrap an already decoded JSON value. The value must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            other => Err(CodecError::NotAnObject(json_kind(&other))),
        }
    }

    /// Read a top-level property as a string.
    ///
    /// Strings are returned verbatim, other scalars as their JSON text.
    /// Absent and `null` properties yield `None`.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.data.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set (or replace) a top-level string property.
    pub fn set_str(&mut self, name: &str, value: impl Into<String>) {
        self.data
            .insert(name.to_string(), Value::String(value.into()));
    }

    /// Remove a top-level property, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.data.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_str(name).is_some()
    }

    /// The `_id` property, if any.
    pub fn id(&self) -> Option<String> {
        self.get_str(ID_FIELD)
    }

    /// The `_rev` property, if any.
    pub fn revision(&self) -> Option<String> {
        self.get_str(REV_FIELD)
    }

    /// Serialize back to compact JSON text.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.data.clone()).to_string()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
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
