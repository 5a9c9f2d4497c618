//! Dynamically-typed payload values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::{DefId, Definition, PeerId};
use crate::error::RemoteError;

/// Handle to a definition owned by the receiving peer.
///
/// Sent instead of a full [`Definition`] when a context is passed back to
/// the peer that exposed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Definition id in the owner's registry.
    pub def_id: DefId,
    /// Peer that owns the definition.
    pub peer_id: PeerId,
}

/// A payload value.
///
/// Definitions, definition lists and references are distinct variants so
/// the dispatcher can find and rewrite them without inspecting maps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Descriptor of a context owned by the sender.
    Definition(Definition),
    /// List of descriptors.
    Definitions(Vec<Definition>),
    /// Handle to a context owned by the receiver.
    Reference(Reference),
    /// Error descriptor in an error reply.
    Error(RemoteError),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Definition(_) => "definition",
            Value::Definitions(_) => "definitions",
            Value::Reference(_) => "reference",
            Value::Error(_) => "error",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value as `u64`, accepting non-negative signed values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Integer value as `i64`, accepting unsigned values that fit.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            Value::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_definition(&self) -> Option<&Definition> {
        match self {
            Value::Definition(def) => Some(def),
            _ => None,
        }
    }

    /// Stamp `origin` as the owner of every definition in this value.
    ///
    /// Walks top-level definitions, definition lists and nested arrays.
    /// Returns the number of definitions rewritten.
    pub fn stamp_origin(&mut self, origin: PeerId) -> usize {
        match self {
            Value::Definition(def) => {
                def.peer_id = Some(origin);
                1
            }
            Value::Definitions(defs) => {
                for def in defs.iter_mut() {
                    def.peer_id = Some(origin);
                }
                defs.len()
            }
            Value::Array(items) => items.iter_mut().map(|v| v.stamp_origin(origin)).sum(),
            _ => 0,
        }
    }

    /// Convert from a JSON value. Integers keep their sign class.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as plain JSON for display.
    ///
    /// Definitions, references and errors are rendered through their serde
    /// form; bytes become an array of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::UInt(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Definition(def) => {
                serde_json::to_value(def).unwrap_or(serde_json::Value::Null)
            }
            Value::Definitions(defs) => {
                serde_json::to_value(defs).unwrap_or(serde_json::Value::Null)
            }
            Value::Reference(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
            Value::Error(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::UInt(u64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Definition> for Value {
    fn from(def: Definition) -> Self {
        Value::Definition(def)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

impl From<RemoteError> for Value {
    fn from(e: RemoteError) -> Self {
        Value::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Capabilities, Capability, DefinitionRegistry};

    fn definition(registry: &DefinitionRegistry, name: &str) -> Definition {
        let mut caps = Capabilities::new();
        caps.insert("foo".to_string(), Capability::Method);
        registry.create_definition(name, "", &caps)
    }

    #[test]
    fn test_stamp_origin_top_level() {
        let registry = DefinitionRegistry::new();
        let origin = PeerId::new();
        let mut value = Value::from(definition(&registry, "a"));

        assert_eq!(value.stamp_origin(origin), 1);
        assert_eq!(value.as_definition().unwrap().peer_id, Some(origin));
    }

    #[test]
    fn test_stamp_origin_definition_list() {
        let registry = DefinitionRegistry::new();
        let origin = PeerId::new();
        let mut value = Value::Definitions(vec![
            definition(&registry, "a"),
            definition(&registry, "b"),
        ]);

        assert_eq!(value.stamp_origin(origin), 2);
        if let Value::Definitions(defs) = &value {
            assert!(defs.iter().all(|d| d.peer_id == Some(origin)));
        } else {
            panic!("variant changed");
        }
    }

    #[test]
    fn test_stamp_origin_nested_arrays() {
        let registry = DefinitionRegistry::new();
        let origin = PeerId::new();
        let mut value = Value::Array(vec![
            Value::from(1u64),
            Value::Array(vec![Value::from(definition(&registry, "deep"))]),
            Value::from(definition(&registry, "shallow")),
        ]);

        assert_eq!(value.stamp_origin(origin), 2);
    }

    #[test]
    fn test_stamp_origin_leaves_plain_values() {
        let origin = PeerId::new();
        let mut value = Value::Array(vec![Value::from("x"), Value::Null, Value::from(3i64)]);
        let before = value.clone();
        assert_eq!(value.stamp_origin(origin), 0);
        assert_eq!(value, before);
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Value::Int(5).as_u64(), Some(5));
        assert_eq!(Value::Int(-5).as_u64(), None);
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
        assert_eq!(Value::UInt(7).as_f64(), Some(7.0));
        assert_eq!(Value::from("7").as_u64(), None);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"a": [1, -2, 1.5, "s", null, true]});
        let value = Value::from_json(json.clone());

        let Value::Map(map) = &value else {
            panic!("expected map");
        };
        let items = map["a"].as_array().unwrap();
        assert_eq!(items[0], Value::UInt(1));
        assert_eq!(items[1], Value::Int(-2));
        assert_eq!(items[2], Value::Float(1.5));

        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Value::Null.kind(), "null");
        assert_eq!(Value::Bytes(vec![1]).kind(), "bytes");
        assert_eq!(Value::Map(BTreeMap::new()).kind(), "map");
    }
}
