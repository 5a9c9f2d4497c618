//! Pluggable payload serializers.
//!
//! A serializer turns the wire representation of a frame into bytes and
//! back. Both peers of a connection must use the same one; MessagePack is
//! the default.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;
use crate::value::Value;

/// Converts values to and from bytes.
pub trait Serializer: Send + Sync + Debug {
    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Serialize a value.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize a value.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    /// Serialize a frame through its wire representation.
    fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.encode(&frame.to_wire())
    }

    /// Deserialize bytes into a frame.
    ///
    /// Undecodable bytes are reported as [`ProtocolError::MalformedFrame`]
    /// so callers see a single failure mode for bad input.
    fn decode_frame(&self, bytes: &[u8]) -> Result<Frame> {
        let value = self.decode(bytes).map_err(|e| match e {
            ProtocolError::Deserialization(msg) => ProtocolError::MalformedFrame(msg),
            other => other,
        })?;
        Frame::decode(value)
    }
}

/// MessagePack with named struct fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// JSON, mainly for debugging traffic by eye.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Look up a serializer by name.
pub fn by_name(name: &str) -> Option<Arc<dyn Serializer>> {
    match name {
        "msgpack" => Some(Arc::new(MsgPackSerializer)),
        "json" => Some(Arc::new(JsonSerializer)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::definition::{Capabilities, Capability, DefinitionRegistry, PeerId};
    use crate::error::{RemoteError, RemoteErrorKind};
    use crate::frame::{Action, Status};
    use crate::value::Reference;

    fn serializers() -> Vec<Arc<dyn Serializer>> {
        vec![Arc::new(MsgPackSerializer), Arc::new(JsonSerializer)]
    }

    fn rich_payload() -> Value {
        let registry = DefinitionRegistry::new();
        let mut caps = Capabilities::new();
        caps.insert("foo".to_string(), Capability::Method);
        caps.insert("bar".to_string(), Capability::readonly());
        let mut def = registry.create_definition("ctx", "test", &caps);
        def.peer_id = Some(PeerId::new());

        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(-3));
        map.insert("bytes".to_string(), Value::Bytes(vec![0, 1, 2, 255]));

        Value::Array(vec![
            Value::from(def.clone()),
            Value::Definitions(vec![def.clone()]),
            Value::Reference(Reference {
                def_id: def.id,
                peer_id: PeerId::new(),
            }),
            Value::Error(RemoteError::new(RemoteErrorKind::NotExists, "gone")),
            Value::Map(map),
            Value::Float(2.5),
            Value::Null,
        ])
    }

    #[test]
    fn test_frame_roundtrip_through_each_serializer() {
        for serializer in serializers() {
            let frame = Frame::new(9, 4, true, Action::Get, Status::Online, rich_payload());
            let bytes = serializer.encode_frame(&frame).unwrap();
            let decoded = serializer.decode_frame(&bytes).unwrap();
            assert_eq!(decoded, frame, "serializer {}", serializer.name());
        }
    }

    #[test]
    fn test_garbage_is_malformed_frame() {
        for serializer in serializers() {
            let err = serializer.decode_frame(&[0xC1, 0x00, 0x7B]).unwrap_err();
            assert!(
                matches!(err, ProtocolError::MalformedFrame(_)),
                "serializer {}: {:?}",
                serializer.name(),
                err
            );
        }
    }

    #[test]
    fn test_wrong_arity_is_malformed_frame() {
        for serializer in serializers() {
            let bytes = serializer
                .encode(&Value::Array(vec![Value::UInt(1), Value::UInt(2)]))
                .unwrap();
            assert!(matches!(
                serializer.decode_frame(&bytes),
                Err(ProtocolError::MalformedFrame(_))
            ));
        }
    }

    #[test]
    fn test_by_name() {
        assert_eq!(by_name("msgpack").unwrap().name(), "msgpack");
        assert_eq!(by_name("json").unwrap().name(), "json");
        assert!(by_name("xml").is_none());
    }
}
