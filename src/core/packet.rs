//! # Packets
//!
//! A packet is one datagram. Every packet starts with a 4-byte signed little-endian header:
//!
//! ```text
//! Short: [FF FF FF FF] [Payload(rest of datagram)]
//! Long:  [FE FF FF FF] [ID(4)] [Total(1)] [Number(1)] [Size(2)]
//!        ([CompressedSize(4)] [CRC32(4)] only if ID bit 31 is set and Number == 0)
//!        [Payload(rest of datagram)]
//! ```
//!
//! The long packet ID carries the compressed flag in its top bit. Compressed payloads are
//! carried verbatim; nothing in this crate decompresses them.
//!
//! The invariant `total >= 1 && number < total` is enforced on both encode and decode.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::codec::{Decodable, Encodable, Identifiable};
use crate::core::wire::WireReader;
use crate::error::{constants, ProtocolError, Result};

/// Header of a single-datagram packet
pub const SHORT_HEADER: i32 = -1;

/// Header of a fragment
pub const LONG_HEADER: i32 = -2;

/// Default maximum payload carried by one fragment
pub const DEFAULT_FRAGMENT_SIZE: usize = 1248;

/// Top bit of the long packet ID
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// Fragmentation IDs must stay strictly below this value
pub const MAX_FRAGMENT_ID: u32 = 0x7FFF_FFFF;

/// Fixed part of a long packet header
const LONG_HEADER_LEN: usize = 12;

/// One fragment of a split message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongPacket {
    /// Fragmentation id (31 bits)
    pub id: u32,
    /// Compressed flag carried in the top bit of the id
    pub compressed: bool,
    /// Number of fragments in the message
    pub total: u8,
    /// 0-based index of this fragment
    pub number: u8,
    /// Nominal maximum fragment payload size
    pub size: i16,
    /// Uncompressed size, only on the wire for compressed first fragments
    pub compressed_size: i32,
    /// CRC32 of the uncompressed data, same condition as `compressed_size`
    pub compressed_crc32: i32,
    pub payload: Bytes,
}

impl Default for LongPacket {
    fn default() -> Self {
        Self {
            id: 0,
            compressed: false,
            total: 1,
            number: 0,
            size: DEFAULT_FRAGMENT_SIZE as i16,
            compressed_size: 0,
            compressed_crc32: 0,
            payload: Bytes::new(),
        }
    }
}

impl LongPacket {
    /// Build a fragment, validating the header invariants
    ///
    /// # Errors
    /// Returns `WrongHeader` if `id` does not fit in 31 bits or `number >= total`.
    pub fn new(id: u32, total: u8, number: u8, payload: Bytes) -> Result<Self> {
        let packet = Self {
            id,
            total,
            number,
            payload,
            ..Self::default()
        };
        packet.validate_outgoing()?;
        Ok(packet)
    }

    /// Check `total >= 1` and `number < total`
    pub fn validate(&self) -> Result<()> {
        if self.total < 1 || self.number >= self.total {
            return Err(ProtocolError::wrong_header(constants::ERR_FRAGMENT_BOUNDS));
        }
        Ok(())
    }

    /// Bounds plus the id range; a received id is taken as is
    fn validate_outgoing(&self) -> Result<()> {
        self.validate()?;
        if self.id >= MAX_FRAGMENT_ID {
            return Err(ProtocolError::wrong_header(constants::ERR_FRAGMENT_ID));
        }
        Ok(())
    }

    /// The raw 32-bit id as written on the wire (compressed flag included)
    pub fn raw_id(&self) -> u32 {
        if self.compressed {
            self.id | COMPRESSED_FLAG
        } else {
            self.id
        }
    }

    /// Whether the compressed size / CRC fields are present on the wire
    fn carries_compression_info(&self) -> bool {
        self.compressed && self.number == 0
    }

    fn decode_body(reader: &mut WireReader<'_>) -> Result<Self> {
        let raw_id = reader.read_u32()?;
        let total = reader.read_u8()?;
        let number = reader.read_u8()?;
        let size = reader.read_i16()?;

        let mut packet = Self {
            id: raw_id & !COMPRESSED_FLAG,
            compressed: raw_id & COMPRESSED_FLAG != 0,
            total,
            number,
            size,
            ..Self::default()
        };
        packet.validate()?;

        if packet.carries_compression_info() {
            packet.compressed_size = reader.read_i32()?;
            packet.compressed_crc32 = reader.read_i32()?;
        }
        packet.payload = Bytes::copy_from_slice(reader.read_rest());
        Ok(packet)
    }
}

/// A single datagram of the query protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Carries a whole message
    Short { payload: Bytes },
    /// Carries one fragment of a message
    Long(LongPacket),
}

impl Packet {
    /// Short packet around an already encoded message
    pub fn short(payload: impl Into<Bytes>) -> Self {
        Packet::Short {
            payload: payload.into(),
        }
    }

    /// The 4-byte header value of this packet
    pub fn header(&self) -> i32 {
        match self {
            Packet::Short { .. } => SHORT_HEADER,
            Packet::Long(_) => LONG_HEADER,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Packet::Short { payload } => payload,
            Packet::Long(long) => &long.payload,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Packet::Long(_))
    }

    /// Size of this packet once encoded
    pub fn wire_len(&self) -> usize {
        match self {
            Packet::Short { payload } => 4 + payload.len(),
            Packet::Long(long) => {
                let compression = if long.carries_compression_info() { 8 } else { 0 };
                LONG_HEADER_LEN + compression + long.payload.len()
            }
        }
    }

    /// Read the 4-byte header without consuming anything
    fn peek_header(bytes: &[u8]) -> Option<i32> {
        let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(i32::from_le_bytes(head))
    }

    /// Decode one datagram
    ///
    /// # Errors
    /// `NotIdentified` when the header is neither short nor long, `WrongHeader` when a long
    /// header is truncated or violates its invariants.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Self::peek_header(bytes).ok_or(ProtocolError::NotIdentified)?;
        let mut reader = WireReader::new(&bytes[4..]);
        match header {
            SHORT_HEADER => Ok(Packet::short(Bytes::copy_from_slice(reader.read_rest()))),
            LONG_HEADER => LongPacket::decode_body(&mut reader).map(Packet::Long),
            _ => Err(ProtocolError::NotIdentified),
        }
    }
}

impl Identifiable for Packet {
    fn identify(bytes: &[u8]) -> bool {
        matches!(Self::peek_header(bytes), Some(SHORT_HEADER | LONG_HEADER))
    }
}

impl Decodable for Packet {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Packet::decode(bytes)
    }
}

impl Encodable for Packet {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Packet::Short { payload } => {
                buf.reserve(4 + payload.len());
                buf.put_i32_le(SHORT_HEADER);
                buf.put_slice(payload);
            }
            Packet::Long(long) => {
                long.validate_outgoing()?;
                buf.reserve(LONG_HEADER_LEN + 8 + long.payload.len());
                buf.put_i32_le(LONG_HEADER);
                buf.put_u32_le(long.raw_id());
                buf.put_u8(long.total);
                buf.put_u8(long.number);
                buf.put_i16_le(long.size);
                if long.carries_compression_info() {
                    buf.put_i32_le(long.compressed_size);
                    buf.put_i32_le(long.compressed_crc32);
                }
                buf.put_slice(&long.payload);
            }
        }
        Ok(())
    }
}

impl From<LongPacket> for Packet {
    fn from(long: LongPacket) -> Self {
        Packet::Long(long)
    }
}
