//! # ctxwire Protocol Library
//!
//! Wire-level building blocks for exposing objects ("contexts") between
//! peers.
//!
//! ## Overview
//!
//! - **Frames**: `[flags, stream_id, id, payload]` with action, status and
//!   impulse bit-packed into `flags`
//! - **Definitions**: descriptors of exposed contexts and their
//!   capability maps, issued by a per-router registry
//! - **Values**: the dynamically-typed payload, with dedicated variants for
//!   definitions and references
//! - **Serializers**: MessagePack (default) or JSON
//! - **Packets**: length-prefixed byte framing with optional LZ4
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Frames (action/status/impulse)      │
//! ├─────────────────────────────────────────┤
//! │     Serializer (MessagePack / JSON)     │
//! ├─────────────────────────────────────────┤
//! │     Packets (length-prefixed, LZ4)      │
//! ├─────────────────────────────────────────┤
//! │     Byte stream (TCP, in-memory)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use protocol::{Action, Frame, MsgPackSerializer, PacketCodec, Serializer, Status, Value};
//!
//! let frame = Frame::new(1, 1, true, Action::Ping, Status::Online, Value::Null);
//! let body = MsgPackSerializer.encode_frame(&frame).unwrap();
//! let packet = PacketCodec::new().encode(&body).unwrap();
//! assert!(packet.len() > body.len());
//! ```

pub mod definition;
pub mod error;
pub mod frame;
pub mod framing;
pub mod serializer;
pub mod value;

pub use definition::{
    Capabilities, Capability, CapabilityMap, DefId, Definition, DefinitionRegistry, PeerId,
    NO_PARENT,
};
pub use error::{ProtocolError, RemoteError, RemoteErrorKind, Result};
pub use frame::{Action, Frame, Header, Status, FRAME_MARKER};
pub use framing::{PacketCodec, PacketFlags, COMPRESSION_THRESHOLD, MAX_PACKET_SIZE};
pub use serializer::{JsonSerializer, MsgPackSerializer, Serializer};
pub use value::{Reference, Value};
