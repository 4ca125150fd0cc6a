//! # Frames
//!
//! A frame is one logical message together with the packets that carry it.
//!
//! Outgoing frames are built from a message and split into long packets when the encoded
//! message exceeds the fragment size. Incoming frames are seeded from the first packet of a
//! message and completed as fragments arrive, in any order.
//!
//! ## Reassembly
//! - Fragments are matched on the 31-bit fragmentation id
//! - A fragment size or total that disagrees with the first fragment is logged and ignored
//! - Once every fragment is present they are sorted by number, concatenated and decoded
//! - A frame that stays incomplete past its deadline is reported expired by [`Frame::is_expired`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tracing::{debug, warn};

use crate::core::codec::Encodable;
use crate::core::message::Message;
use crate::core::packet::{LongPacket, Packet, MAX_FRAGMENT_ID};
use crate::core::registry::MessageRegistry;
use crate::error::{constants, ProtocolError, Result};

const ERR_FRAGMENT_SIZE: &str = "Fragment size must be between 1 and 32767";

/// A message and its packets
#[derive(Debug, Clone)]
pub struct Frame {
    id: Option<u32>,
    total: u8,
    size: i16,
    packets: Vec<Packet>,
    message: Option<Message>,
    registry: Option<Arc<MessageRegistry>>,
    started_at: Instant,
}

impl Frame {
    /// Build an outgoing frame, fragmenting when the encoded message exceeds `max_size`
    ///
    /// # Errors
    /// `OversizedMessage` when more than 255 fragments would be needed, `WrongHeader` for a
    /// fragment size that does not fit the wire field, or any encoding error.
    pub fn from_message(message: Message, max_size: usize) -> Result<Self> {
        let size = i16::try_from(max_size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| ProtocolError::wrong_header(ERR_FRAGMENT_SIZE))?;
        let bytes = message.to_bytes()?;

        if bytes.len() <= max_size {
            return Ok(Self::completed(
                None,
                1,
                size,
                vec![Packet::short(bytes)],
                message,
            ));
        }

        let count = bytes.len().div_ceil(max_size);
        let total = u8::try_from(count).map_err(|_| ProtocolError::OversizedMessage(bytes.len()))?;
        let id = rand::rng().random_range(0..MAX_FRAGMENT_ID);

        let mut packets = Vec::with_capacity(count);
        for number in 0..total {
            let start = usize::from(number) * max_size;
            let end = (start + max_size).min(bytes.len());
            let mut packet = LongPacket::new(id, total, number, bytes.slice(start..end))?;
            packet.size = size;
            packets.push(Packet::Long(packet));
        }

        debug!(id, total, bytes = bytes.len(), kind = message.kind_name(), "Fragmented message");
        Ok(Self::completed(Some(id), total, size, packets, message))
    }

    /// Seed an incoming frame from the first packet received for a message
    ///
    /// A short packet, or a long packet announcing a single fragment, completes the frame
    /// immediately.
    pub fn from_packet(packet: Packet, registry: Arc<MessageRegistry>) -> Result<Self> {
        let long = match packet {
            Packet::Short { payload } => {
                let message = registry.decode(&payload)?;
                let mut frame = Self::completed(None, 1, 0, vec![Packet::Short { payload }], message);
                frame.registry = Some(registry);
                return Ok(frame);
            }
            Packet::Long(long) => long,
        };

        let mut frame = Self {
            id: Some(long.id),
            total: long.total,
            size: long.size,
            packets: Vec::with_capacity(usize::from(long.total)),
            message: None,
            registry: Some(registry),
            started_at: Instant::now(),
        };
        frame.packets.push(Packet::Long(long));
        frame.try_assemble()?;
        Ok(frame)
    }

    fn completed(id: Option<u32>, total: u8, size: i16, packets: Vec<Packet>, message: Message) -> Self {
        Self {
            id,
            total,
            size,
            packets,
            message: Some(message),
            registry: None,
            started_at: Instant::now(),
        }
    }

    /// Add a fragment to an incomplete frame
    ///
    /// # Errors
    /// `AlreadyCompleted`, `WrongPacketType` for a short packet, `WrongPacketId`,
    /// `DuplicateFragment`, `WrongHeader` for a number outside the frame, or the decode
    /// error of the reassembled message.
    pub fn add_packet(&mut self, packet: Packet) -> Result<()> {
        if self.is_completed() {
            return Err(ProtocolError::AlreadyCompleted);
        }
        let Packet::Long(long) = packet else {
            return Err(ProtocolError::WrongPacketType);
        };

        let expected = self.id.unwrap_or_default();
        if long.id != expected {
            return Err(ProtocolError::WrongPacketId {
                expected,
                actual: long.id,
            });
        }
        if long.size != self.size {
            warn!(id = long.id, expected = self.size, actual = long.size, "Fragment size mismatch");
        }
        if long.total != self.total {
            warn!(id = long.id, expected = self.total, actual = long.total, "Fragment total mismatch");
        }
        if long.number >= self.total {
            return Err(ProtocolError::wrong_header(constants::ERR_FRAGMENT_BOUNDS));
        }
        if self.fragment_numbers().any(|n| n == long.number) {
            return Err(ProtocolError::DuplicateFragment(long.number));
        }

        self.packets.push(Packet::Long(long));
        self.try_assemble()
    }

    fn fragment_numbers(&self) -> impl Iterator<Item = u8> + '_ {
        self.packets.iter().filter_map(|p| match p {
            Packet::Long(long) => Some(long.number),
            Packet::Short { .. } => None,
        })
    }

    fn fragment_number(packet: &Packet) -> u8 {
        match packet {
            Packet::Long(long) => long.number,
            Packet::Short { .. } => 0,
        }
    }

    fn try_assemble(&mut self) -> Result<()> {
        if self.packets.len() < usize::from(self.total) {
            return Ok(());
        }

        self.packets.sort_by_key(Self::fragment_number);
        let mut buf = BytesMut::with_capacity(self.packets.iter().map(|p| p.payload().len()).sum());
        for packet in &self.packets {
            buf.extend_from_slice(packet.payload());
        }

        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?;
        let message = registry.decode(&buf)?;
        debug!(id = ?self.id, total = self.total, kind = message.kind_name(), "Reassembled frame");
        self.message = Some(message);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.message.is_some()
    }

    /// The message, once complete
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn into_message(self) -> Option<Message> {
        self.message
    }

    /// Fragmentation id, `None` for a single short packet
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    /// Packets held so far; every call starts from the first packet
    pub fn packets(&self) -> impl Iterator<Item = &Packet> + '_ {
        self.packets.iter()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether an incomplete frame has waited longer than `deadline`
    pub fn is_expired(&self, deadline: Duration) -> bool {
        !self.is_completed() && self.started_at.elapsed() > deadline
    }

    /// Serialize every packet, ready to be sent as individual datagrams
    pub fn datagrams(&self) -> Result<Vec<Bytes>> {
        self.packets.iter().map(|p| p.to_bytes()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::message::{Rule, S2aRules};
    use crate::core::packet::DEFAULT_FRAGMENT_SIZE;

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(MessageRegistry::with_player_ex())
    }

    fn big_rules(count: usize) -> Message {
        Message::S2aRules(S2aRules {
            rules: (0..count)
                .map(|i| {
                    Rule::new(
                        format!("SuperLongAndBoringRuleKeyThatHopefullyWillSplitMsgs_{i}"),
                        format!("SuperLongAndBoringRuleValueThatHopefullyWillSplitMsgs_{i}"),
                    )
                })
                .collect(),
        })
    }

    #[test]
    fn test_small_message_single_short_packet() {
        let frame = Frame::from_message(Message::challenge_reply(7), DEFAULT_FRAGMENT_SIZE).unwrap();
        assert!(frame.is_completed());
        assert_eq!(frame.id(), None);
        let packets: Vec<_> = frame.packets().collect();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_long());
    }

    #[test]
    fn test_fragmentation_layout() {
        let message = big_rules(255);
        let encoded_len = message.to_bytes().unwrap().len();
        let frame = Frame::from_message(message, DEFAULT_FRAGMENT_SIZE).unwrap();

        let expected = encoded_len.div_ceil(DEFAULT_FRAGMENT_SIZE);
        assert_eq!(usize::from(frame.total()), expected);
        let id = frame.id().unwrap();
        assert!(id < MAX_FRAGMENT_ID);

        for (index, packet) in frame.packets().enumerate() {
            match packet {
                Packet::Long(long) => {
                    assert_eq!(long.id, id);
                    assert_eq!(usize::from(long.number), index);
                    assert_eq!(usize::from(long.total), expected);
                    assert_eq!(long.size, 1248);
                    assert!(long.payload.len() <= DEFAULT_FRAGMENT_SIZE);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // restartable
        assert_eq!(frame.packets().count(), expected);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let message = big_rules(255);
        let outgoing = Frame::from_message(message.clone(), DEFAULT_FRAGMENT_SIZE).unwrap();
        let mut packets: Vec<Packet> = outgoing.packets().cloned().collect();
        packets.reverse();

        let mut iter = packets.into_iter();
        let mut frame = Frame::from_packet(iter.next().unwrap(), registry()).unwrap();
        assert!(!frame.is_completed());
        for packet in iter {
            frame.add_packet(packet).unwrap();
        }
        assert_eq!(frame.message(), Some(&message));
    }

    #[test]
    fn test_add_packet_errors() {
        let outgoing = Frame::from_message(big_rules(100), 512).unwrap();
        let packets: Vec<Packet> = outgoing.packets().cloned().collect();
        let mut frame = Frame::from_packet(packets[0].clone(), registry()).unwrap();

        assert!(matches!(
            frame.add_packet(packets[0].clone()),
            Err(ProtocolError::DuplicateFragment(0))
        ));
        assert!(matches!(
            frame.add_packet(Packet::short(Bytes::from_static(&[0x55]))),
            Err(ProtocolError::WrongPacketType)
        ));

        let foreign_id = (outgoing.id().unwrap() + 1) % MAX_FRAGMENT_ID;
        let foreign = LongPacket::new(foreign_id, frame.total(), 1, Bytes::new()).unwrap();
        assert!(matches!(
            frame.add_packet(Packet::Long(foreign)),
            Err(ProtocolError::WrongPacketId { .. })
        ));

        for packet in packets.into_iter().skip(1) {
            frame.add_packet(packet).unwrap();
        }
        assert!(frame.is_completed());
        assert!(matches!(
            frame.add_packet(Packet::short(Bytes::new())),
            Err(ProtocolError::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_size_mismatch_is_tolerated() {
        let outgoing = Frame::from_message(big_rules(40), 256).unwrap();
        let mut packets: Vec<Packet> = outgoing.packets().cloned().collect();
        if let Packet::Long(long) = &mut packets[1] {
            long.size = 512;
        }

        let mut iter = packets.into_iter();
        let mut frame = Frame::from_packet(iter.next().unwrap(), registry()).unwrap();
        for packet in iter {
            frame.add_packet(packet).unwrap();
        }
        assert!(frame.is_completed());
    }

    #[test]
    fn test_single_fragment_long_packet_completes() {
        let payload = Message::challenge_reply(3).to_bytes().unwrap();
        let packet = Packet::Long(LongPacket::new(10, 1, 0, payload).unwrap());
        let frame = Frame::from_packet(packet, registry()).unwrap();
        assert!(frame.is_completed());
        assert_eq!(frame.message(), Some(&Message::challenge_reply(3)));
    }

    #[test]
    fn test_oversized_message() {
        let result = Frame::from_message(big_rules(255), 64);
        assert!(matches!(result, Err(ProtocolError::OversizedMessage(_))));
        assert!(matches!(
            Frame::from_message(Message::info_request(), 0),
            Err(ProtocolError::WrongHeader(_))
        ));
    }

    #[test]
    fn test_expiry_only_applies_to_incomplete_frames() {
        let outgoing = Frame::from_message(big_rules(40), 256).unwrap();
        let first = outgoing.packets().next().cloned().unwrap();
        let frame = Frame::from_packet(first, registry()).unwrap();
        assert!(!frame.is_expired(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(frame.is_expired(Duration::from_millis(1)));
        assert!(!outgoing.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_datagrams_carry_headers() {
        let frame = Frame::from_message(big_rules(40), 256).unwrap();
        let total = usize::from(frame.total());
        let datagrams = frame.datagrams().unwrap();
        assert_eq!(datagrams.len(), total);
        for datagram in datagrams {
            assert_eq!(&datagram[..4], &[0xFE, 0xFF, 0xFF, 0xFF]);
        }
    }
}
