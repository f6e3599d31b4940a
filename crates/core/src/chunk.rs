//! Chunk: the structured record that flows between pipeline stages.
//!
//! A chunk is an ordered map of field name to [`Value`]. Text filters
//! overwrite `content`; audio stages redefine `audio_bytes` together with
//! `sr`/`sw`/`ch`. Each operation kind declares which fields it needs
//! (see [`crate::operation::OpKind::extract`]).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single field value inside a [`Chunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Nested structures (message lists, metadata objects).
    Json(serde_json::Value),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Short type name used in contract-violation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Json(_) => "json",
        }
    }

    /// JSON rendering for the event bus. Bytes become base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Json(v) => v.clone(),
        }
    }

    /// Inverse of [`Value::to_json`] for scalar types; bytes are not inferred.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            other => Value::Json(other),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// A mapping of field name to value, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    fields: IndexMap<String, Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert or overwrite a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.shift_remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_text)
    }

    pub fn bytes(&self, field: &str) -> Option<&[u8]> {
        self.get(field).and_then(Value::as_bytes)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay every field of `other` onto this chunk.
    pub fn merge(&mut self, other: Chunk) {
        self.fields.extend(other.fields);
    }

    /// JSON object rendering for event payloads.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Build a chunk from a JSON object. Non-object input yields an empty chunk.
    pub fn from_json(value: serde_json::Value) -> Self {
        let mut chunk = Chunk::new();
        if let serde_json::Value::Object(map) = value {
            for (k, v) in map {
                chunk.insert(k, Value::from_json(v));
            }
        }
        chunk
    }
}

impl FromIterator<(String, Value)> for Chunk {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_accessors() {
        let chunk = Chunk::new()
            .with("content", "hello")
            .with("sr", 24_000i64)
            .with("audio_bytes", vec![1u8, 2, 3]);

        assert_eq!(chunk.text("content"), Some("hello"));
        assert_eq!(chunk.int("sr"), Some(24_000));
        assert_eq!(chunk.bytes("audio_bytes"), Some(&[1u8, 2, 3][..]));
        assert!(chunk.text("sr").is_none());
        assert_eq!(chunk.len(), 3);
    }

    #[test]
    fn merge_overwrites_fields() {
        let mut chunk = Chunk::new().with("content", "raw").with("emotion", "joy");
        chunk.merge(Chunk::new().with("content", "clean"));
        assert_eq!(chunk.text("content"), Some("clean"));
        assert_eq!(chunk.text("emotion"), Some("joy"));
    }

    #[test]
    fn json_rendering_encodes_bytes_as_base64() {
        let chunk = Chunk::new().with("audio_bytes", b"abc".to_vec()).with("ch", 1i64);
        let json = chunk.to_json();
        assert_eq!(json["audio_bytes"], "YWJj");
        assert_eq!(json["ch"], 1);
    }

    #[test]
    fn from_json_maps_scalars() {
        let chunk = Chunk::from_json(serde_json::json!({
            "content": "hi",
            "sr": 16000,
            "gain": 0.5,
            "messages": [{"type": "raw", "message": "x"}]
        }));
        assert_eq!(chunk.text("content"), Some("hi"));
        assert_eq!(chunk.int("sr"), Some(16000));
        assert_eq!(chunk.get("gain"), Some(&Value::Float(0.5)));
        assert!(chunk.get("messages").and_then(Value::as_json).is_some());
    }

    #[test]
    fn fields_keep_insertion_order() {
        let mut chunk = Chunk::new()
            .with("content", "hi")
            .with("audio_bytes", vec![0u8])
            .with("sr", 24_000i64)
            .with("emotion", "calm");
        chunk.remove("audio_bytes");
        chunk.insert("content", "hello");

        let names: Vec<&str> = chunk.fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["content", "sr", "emotion"]);

        let json = chunk.to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["content", "sr", "emotion"]);
    }
}
