//! # Codec Capabilities
//!
//! Small capability traits shared by every wire type, plus the Tokio codec that lets a
//! `UdpSocket` be driven through `tokio_util::udp::UdpFramed`.
//!
//! ## Traits
//! - [`Identifiable`]: non-destructive discriminant check
//! - [`Encodable`]: exact byte layout writer
//! - [`Decodable`]: self-contained decoder (types that need a registry decode through it instead)
//!
//! ## Datagram Framing
//! UDP already delimits messages, so [`PacketCodec`] treats the whole read buffer as one
//! packet. The buffer is always drained before parsing, which keeps a malformed datagram
//! from being decoded twice by `UdpFramed`.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};

/// Check whether a buffer starts with this type's discriminant, without consuming it
pub trait Identifiable {
    fn identify(bytes: &[u8]) -> bool;
}

/// Byte-exact serialization
pub trait Encodable {
    /// Append the encoded form to `buf`
    ///
    /// # Errors
    /// Returns `WrongHeader` / `InvalidField` when the value violates a structural invariant.
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()>;

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decoding for types whose layout does not depend on a registry
pub trait Decodable: Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Datagram codec for `UdpFramed`: one datagram in, one [`Packet`] out
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        // Drain first: on error UdpFramed polls again with the same buffer
        let datagram = src.split().freeze();
        trace!(bytes = datagram.len(), "Decoding datagram");
        Packet::decode(&datagram).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_codec_roundtrip_short_packet() {
        let mut codec = PacketCodec;
        let packet = Packet::short(Bytes::from_static(&[0x55, 0x01, 0x02, 0x03, 0x04]));

        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_drains_buffer_on_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0x01, 0x02, 0x03, 0x04, 0x05][..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::NotIdentified)
        ));
        assert!(buf.is_empty());
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }
}
