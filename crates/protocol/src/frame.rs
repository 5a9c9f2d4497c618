//! Protocol frames and their bit-packed header.
//!
//! # Wire Shape
//!
//! Every frame is handed to the payload serializer as an ordered 4-element
//! sequence:
//!
//! ```text
//! [flags: u32, stream_id: u32, id: u64, payload: Value]
//! ```
//!
//! # Flags Layout
//!
//! ```text
//!  31  30  29 ........ 16  15 ...... 8  7 ....... 0
//! ┌───┬───┬──────────────┬────────────┬───────────┐
//! │ M │ I │   reserved   │   status   │  action   │
//! └───┴───┴──────────────┴────────────┴───────────┘
//! ```
//!
//! - `action`: 8 bits at offset 0
//! - `status`: 8 bits at offset 8
//! - `I` (impulse): 1 bit at offset 30, set when the frame expects a reply
//! - `M` (marker): always written as 1, ignored when reading
//!
//! Values wider than their field are truncated to the field width. Callers
//! rely on this, so it is part of the contract.

use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::value::Value;

/// Bit offset of the action field.
pub const ACTION_OFFSET: u32 = 0;

/// Bit offset of the status field.
pub const STATUS_OFFSET: u32 = 8;

/// Bit offset of the impulse flag.
pub const IMPULSE_OFFSET: u32 = 30;

/// Constant marker bit written into every encoded flags word.
pub const FRAME_MARKER: u32 = 1 << 31;

const BYTE_MASK: u32 = 0xFF;

/// Number of elements in the wire representation of a frame.
pub const WIRE_ARITY: usize = 4;

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Identity and context exchange when a connection comes up.
    Handshake = 0,
    /// Invoke a method or read a property on a remote context.
    Get = 1,
    /// Write a property, or invoke a method discarding its result.
    Set = 2,
    /// Liveness check.
    Ping = 3,
    /// Announce a context exposed to the receiving peer.
    ContextAttach = 4,
    /// Withdraw a previously announced context.
    ContextDetach = 5,
    /// Subscribe to a named event of the receiving peer.
    EventOn = 6,
    /// Drop a subscription made with `EVENT_ON`.
    EventOff = 7,
    /// Deliver a named event to a subscriber.
    EventEmit = 8,
}

impl Action {
    /// Raw action code.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Action::Handshake),
            1 => Ok(Action::Get),
            2 => Ok(Action::Set),
            3 => Ok(Action::Ping),
            4 => Ok(Action::ContextAttach),
            5 => Ok(Action::ContextDetach),
            6 => Ok(Action::EventOn),
            7 => Ok(Action::EventOff),
            8 => Ok(Action::EventEmit),
            other => Err(other),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Handshake => "HANDSHAKE",
            Action::Get => "GET",
            Action::Set => "SET",
            Action::Ping => "PING",
            Action::ContextAttach => "CONTEXT_ATTACH",
            Action::ContextDetach => "CONTEXT_DETACH",
            Action::EventOn => "EVENT_ON",
            Action::EventOff => "EVENT_OFF",
            Action::EventEmit => "EVENT_EMIT",
        };
        f.write_str(name)
    }
}

/// Outcome or phase code carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Sender is offline.
    Offline = 0,
    /// Sender is establishing the transport.
    Connecting = 1,
    /// Sender is exchanging identities.
    Handshaking = 2,
    /// Normal operation, or a successful reply.
    Online = 3,
    /// Reply carrying an error descriptor.
    Error = 4,
}

impl Status {
    /// Raw status code.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        match code {
            0 => Ok(Status::Offline),
            1 => Ok(Status::Connecting),
            2 => Ok(Status::Handshaking),
            3 => Ok(Status::Online),
            4 => Ok(Status::Error),
            other => Err(other),
        }
    }
}

/// The three sub-fields packed into a frame's flags word.
///
/// Each field is stored separately, so setting one can never disturb the
/// others. Packing and unpacking are the only places bits are shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    action: u8,
    status: u8,
    impulse: bool,
}

impl Header {
    /// Build a header, truncating each value to its field width.
    pub fn new(impulse: u32, action: u32, status: u32) -> Self {
        let mut header = Self::default();
        header.set_impulse(impulse);
        header.set_action(action);
        header.set_status(status);
        header
    }

    /// Read a header back out of a packed flags word.
    pub fn unpack(flags: u32) -> Self {
        Self {
            action: ((flags >> ACTION_OFFSET) & BYTE_MASK) as u8,
            status: ((flags >> STATUS_OFFSET) & BYTE_MASK) as u8,
            impulse: (flags >> IMPULSE_OFFSET) & 1 == 1,
        }
    }

    /// Pack the header into a flags word.
    pub fn pack(self) -> u32 {
        FRAME_MARKER
            | (u32::from(self.impulse) << IMPULSE_OFFSET)
            | (u32::from(self.status) << STATUS_OFFSET)
            | (u32::from(self.action) << ACTION_OFFSET)
    }

    /// Action code.
    #[inline]
    pub fn action(self) -> u8 {
        self.action
    }

    /// Status code.
    #[inline]
    pub fn status(self) -> u8 {
        self.status
    }

    /// Whether the frame expects a correlated reply.
    #[inline]
    pub fn impulse(self) -> bool {
        self.impulse
    }

    /// Set the action, keeping only the low 8 bits.
    #[inline]
    pub fn set_action(&mut self, action: u32) {
        self.action = (action & BYTE_MASK) as u8;
    }

    /// Set the status, keeping only the low 8 bits.
    #[inline]
    pub fn set_status(&mut self, status: u32) {
        self.status = (status & BYTE_MASK) as u8;
    }

    /// Set the impulse flag, keeping only the low bit.
    #[inline]
    pub fn set_impulse(&mut self, impulse: u32) {
        self.impulse = impulse & 1 == 1;
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Per-connection sequence number.
    pub id: u64,
    /// Logical exchange this frame belongs to.
    pub stream_id: u32,
    /// Action, status and impulse.
    pub header: Header,
    /// Opaque payload.
    pub payload: Value,
}

impl Frame {
    /// Construct a frame from raw field values.
    ///
    /// `impulse`, `action` and `status` are truncated to 1, 8 and 8 bits.
    pub fn encode(
        id: u64,
        stream_id: u32,
        impulse: u32,
        action: u32,
        status: u32,
        payload: Value,
    ) -> Self {
        Self {
            id,
            stream_id,
            header: Header::new(impulse, action, status),
            payload,
        }
    }

    /// Construct a frame from typed action and status codes.
    pub fn new(
        id: u64,
        stream_id: u32,
        impulse: bool,
        action: Action,
        status: Status,
        payload: Value,
    ) -> Self {
        Self::encode(
            id,
            stream_id,
            u32::from(impulse),
            u32::from(action.code()),
            u32::from(status.code()),
            payload,
        )
    }

    /// Decode a frame from its wire representation.
    ///
    /// Fails with [`ProtocolError::MalformedFrame`] unless `repr` is an
    /// ordered 4-element sequence of `[flags, stream_id, id, payload]`
    /// whose numeric fields fit their widths.
    pub fn decode(repr: Value) -> Result<Self> {
        let items = match repr {
            Value::Array(items) => items,
            other => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "expected a {}-element sequence, got {}",
                    WIRE_ARITY,
                    other.kind()
                )))
            }
        };

        let [flags, stream_id, id, payload]: [Value; WIRE_ARITY] =
            items.try_into().map_err(|items: Vec<Value>| {
                ProtocolError::MalformedFrame(format!(
                    "expected {} elements, got {}",
                    WIRE_ARITY,
                    items.len()
                ))
            })?;

        let flags = wire_uint(&flags, "flags", u64::from(u32::MAX))? as u32;
        let stream_id = wire_uint(&stream_id, "stream_id", u64::from(u32::MAX))? as u32;
        let id = wire_uint(&id, "id", u64::MAX)?;

        Ok(Self {
            id,
            stream_id,
            header: Header::unpack(flags),
            payload,
        })
    }

    /// Wire representation handed to the payload serializer.
    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::UInt(u64::from(self.flags())),
            Value::UInt(u64::from(self.stream_id)),
            Value::UInt(self.id),
            self.payload.clone(),
        ])
    }

    /// Consuming variant of [`Frame::to_wire`].
    pub fn into_wire(self) -> Value {
        let flags = self.flags();
        Value::Array(vec![
            Value::UInt(u64::from(flags)),
            Value::UInt(u64::from(self.stream_id)),
            Value::UInt(self.id),
            self.payload,
        ])
    }

    /// Packed flags word.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.header.pack()
    }

    /// Raw action code.
    #[inline]
    pub fn action(&self) -> u8 {
        self.header.action()
    }

    /// Raw status code.
    #[inline]
    pub fn status(&self) -> u8 {
        self.header.status()
    }

    /// Whether this frame expects a correlated reply.
    #[inline]
    pub fn impulse(&self) -> bool {
        self.header.impulse()
    }
}

fn wire_uint(value: &Value, field: &str, max: u64) -> Result<u64> {
    let n = match value {
        Value::UInt(n) => *n,
        Value::Int(n) if *n >= 0 => *n as u64,
        other => {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} must be an unsigned integer, got {}",
                field,
                other.kind()
            )))
        }
    };
    if n > max {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} {} exceeds maximum {}",
            field, n, max
        )));
    }
    Ok(n)
}
