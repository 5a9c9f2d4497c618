//! Byte-stream packet codec with optional LZ4 compression.
//!
//! Serialized frames travel over stream transports as packets:
//!
//! ```text
//! ┌───────────┬───────┬──────────────┬─────────────────┐
//! │ magic "CW"│ flags │ length (BE)  │ body            │
//! │  2 bytes  │ 1 byte│  4 bytes     │ `length` bytes  │
//! └───────────┴───────┴──────────────┴─────────────────┘
//! ```
//!
//! Bodies larger than [`COMPRESSION_THRESHOLD`] are LZ4-compressed when that
//! actually makes them smaller; bit 0 of `flags` records it.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};

/// Magic bytes opening every packet.
pub const PACKET_MAGIC: [u8; 2] = *b"CW";

/// Bodies above this many bytes are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Default upper bound on a packet, header included (16 MB).
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Magic + flags + length.
pub const PACKET_HEADER_SIZE: usize = 7;

/// Per-packet flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Body is LZ4-compressed with its size prepended.
    pub const COMPRESSED: u8 = 0b0000_0001;

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    #[inline]
    pub fn compressed() -> Self {
        Self(Self::COMPRESSED)
    }
}

/// Encoder and incremental decoder for packets.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    compression: bool,
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Codec with compression enabled and the default size limit.
    pub fn new() -> Self {
        Self {
            compression: true,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Codec that never compresses. It still accepts compressed packets.
    pub fn without_compression() -> Self {
        Self {
            compression: false,
            ..Self::new()
        }
    }

    /// Override the size limit.
    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max.max(PACKET_HEADER_SIZE);
        self
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Wrap a serialized frame into a packet.
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>> {
        // The receiver bounds the inflated body by the same limit.
        if PACKET_HEADER_SIZE + body.len() > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: PACKET_HEADER_SIZE + body.len(),
                max: self.max_packet_size,
            });
        }

        let compressed = if self.compression && body.len() > COMPRESSION_THRESHOLD {
            let packed = lz4_flex::compress_prepend_size(body);
            (packed.len() < body.len()).then_some(packed)
        } else {
            None
        };

        let (flags, body) = match &compressed {
            Some(packed) => (PacketFlags::compressed(), packed.as_slice()),
            None => (PacketFlags::default(), body),
        };

        let total = PACKET_HEADER_SIZE + body.len();
        if total > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&PACKET_MAGIC);
        out.push(flags.as_byte());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Take one complete packet off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the packet is
    /// still incomplete. A bad magic or an oversized length is an error;
    /// the stream cannot be resynchronised after either.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        if buf[..2] != PACKET_MAGIC {
            return Err(ProtocolError::Deserialization(format!(
                "invalid packet magic: expected {:02x?}, got {:02x?}",
                PACKET_MAGIC,
                &buf[..2]
            )));
        }

        let flags = PacketFlags::from_byte(buf[2]);
        let len = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;

        let total = PACKET_HEADER_SIZE + len;
        if total > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }

        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(PACKET_HEADER_SIZE);
        let body = buf.split_to(len);

        if flags.is_compressed() {
            let declared = body
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .ok_or_else(|| {
                    ProtocolError::Deserialization("lz4: missing size prefix".to_string())
                })?;
            let inflated = PACKET_HEADER_SIZE.saturating_add(declared);
            if inflated > self.max_packet_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: inflated,
                    max: self.max_packet_size,
                });
            }
            lz4_flex::decompress_size_prepended(&body)
                .map(Some)
                .map_err(|e| ProtocolError::Deserialization(format!("lz4: {}", e)))
        } else {
            Ok(Some(body.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn test_small_body_roundtrip() {
        let codec = PacketCodec::new();
        let packet = codec.encode(b"hello").unwrap();

        assert_eq!(&packet[..2], b"CW");
        assert_eq!(packet[2], 0);
        assert_eq!(&packet[3..7], &5u32.to_be_bytes());

        let mut buf = buffer(&packet);
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let codec = PacketCodec::new();
        let mut buf = buffer(&codec.encode(&[]).unwrap());
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_large_repetitive_body_is_compressed() {
        let codec = PacketCodec::new();
        let body = vec![0x5Au8; COMPRESSION_THRESHOLD * 8];
        let packet = codec.encode(&body).unwrap();

        assert!(PacketFlags::from_byte(packet[2]).is_compressed());
        assert!(packet.len() < body.len());

        let mut buf = buffer(&packet);
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), body);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let codec = PacketCodec::new();
        let body = vec![0u8; COMPRESSION_THRESHOLD];
        let packet = codec.encode(&body).unwrap();
        assert!(!PacketFlags::from_byte(packet[2]).is_compressed());
    }

    #[test]
    fn test_incompressible_body_is_sent_raw() {
        let codec = PacketCodec::new();
        // LCG noise defeats LZ4.
        let mut state = 0x1234_5678u32;
        let body: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        let packet = codec.encode(&body).unwrap();
        assert!(!PacketFlags::from_byte(packet[2]).is_compressed());
        assert_eq!(packet.len(), PACKET_HEADER_SIZE + body.len());
    }

    #[test]
    fn test_without_compression_still_decodes_compressed() {
        let body = vec![1u8; 10_000];
        let packet = PacketCodec::new().encode(&body).unwrap();

        let plain = PacketCodec::without_compression();
        assert!(!plain.compression_enabled());
        assert!(!PacketFlags::from_byte(plain.encode(&body).unwrap()[2]).is_compressed());

        let mut buf = buffer(&packet);
        assert_eq!(plain.decode_from(&mut buf).unwrap().unwrap(), body);
    }

    #[test]
    fn test_partial_packet_waits() {
        let codec = PacketCodec::new();
        let packet = codec.encode(b"partial").unwrap();

        let mut buf = buffer(&packet[..4]);
        assert!(codec.decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        let mut buf = buffer(&packet[..packet.len() - 1]);
        assert!(codec.decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&packet[packet.len() - 1..]);
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), b"partial");
    }

    #[test]
    fn test_back_to_back_packets() {
        let codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&codec.encode(b"one").unwrap());
        buf.extend_from_slice(&codec.encode(b"two").unwrap());
        buf.extend_from_slice(&codec.encode(b"three").unwrap());

        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), b"one");
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), b"two");
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), b"three");
        assert!(codec.decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let codec = PacketCodec::new();
        let mut buf = buffer(b"XX\x00\x00\x00\x00\x01a");
        let err = codec.decode_from(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let codec = PacketCodec::new().with_max_packet_size(64);
        let mut header = Vec::from(PACKET_MAGIC);
        header.push(0);
        header.extend_from_slice(&1000u32.to_be_bytes());
        let mut buf = buffer(&header);
        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 1007, max: 64 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let codec = PacketCodec::without_compression().with_max_packet_size(16);
        assert!(matches!(
            codec.encode(&[0u8; 32]),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_inflated_size_is_bounded() {
        let codec = PacketCodec::new().with_max_packet_size(1024);
        let mut packet = Vec::from(PACKET_MAGIC);
        packet.push(PacketFlags::COMPRESSED);
        packet.extend_from_slice(&8u32.to_be_bytes());
        // Claims 4 GB once inflated.
        packet.extend_from_slice(&u32::MAX.to_le_bytes());
        packet.extend_from_slice(&[0x10, 0x00, 0x00, 0x00]);
        let mut buf = buffer(&packet);
        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn test_compressible_body_over_limit_is_rejected() {
        let codec = PacketCodec::new().with_max_packet_size(4096);
        assert!(matches!(
            codec.encode(&vec![0u8; 10_000]),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_corrupted_compressed_body() {
        let codec = PacketCodec::new();
        let mut packet = Vec::from(PACKET_MAGIC);
        packet.push(PacketFlags::COMPRESSED);
        packet.extend_from_slice(&5u32.to_be_bytes());
        packet.extend_from_slice(&[0x10, 0x00, 0x00, 0x00, 0xFF]);
        let mut buf = buffer(&packet);
        assert!(codec.decode_from(&mut buf).is_err());
    }
}
