use flowcontext::path::{self, Segment};
use flowcontext::ContextError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field holding the correlation id.
pub const MSG_ID: &str = "_msgid";

/// A message travelling between nodes: an open set of named JSON fields.
///
/// The correlation id lives in `_msgid` and is assigned lazily the first
/// time the message is sent or received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<Value>) -> Self {
        let mut msg = Self::new();
        msg.set_payload(payload);
        msg
    }

    /// Build from a JSON value; only objects are messages.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.fields
            .get(MSG_ID)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields.insert(MSG_ID.to_string(), Value::String(id.into()));
    }

    /// Assign a fresh id if the message has none, returning the id.
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let id = generate_id();
        self.set_id(id.clone());
        id
    }

    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    pub fn set_payload(&mut self, payload: impl Into<Value>) {
        self.fields.insert("payload".to_string(), payload.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Read a property expression such as `payload.items[0]`.
    pub fn property(&self, expr: &str) -> Result<Option<&Value>, ContextError> {
        let segments = path::parse(expr)?;
        Ok(match segments.split_first() {
            Some((Segment::Key(first), rest)) => self.fields.get(first).and_then(|v| path::get(v, rest)),
            _ => None,
        })
    }

    /// Write a property expression; `None` removes the property.
    pub fn set_property(&mut self, expr: &str, value: Option<Value>) -> Result<(), ContextError> {
        let segments = path::parse(expr)?;
        let mut root = Value::Object(std::mem::take(&mut self.fields));
        path::set(&mut root, &segments, value);
        if let Value::Object(fields) = root {
            self.fields = fields;
        }
        Ok(())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// A new correlation id: 16 lowercase hex characters.
pub fn generate_id() -> String {
    format!("{:016x}", Uuid::new_v4().as_u64_pair().0)
}
