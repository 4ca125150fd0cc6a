//! Property-based tests using proptest
//!
//! These tests validate protocol invariants across randomly generated messages and
//! datagrams: fragmentation never loses data, decoders never panic on garbage.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use source_query_protocol::core::codec::Encodable;
use source_query_protocol::core::message::{Rule, S2aRules};
use source_query_protocol::core::packet::Packet;
use source_query_protocol::core::registry::MessageRegistry;
use source_query_protocol::{Frame, Message};

fn rules_strategy() -> impl Strategy<Value = Message> {
    prop::collection::vec(("[a-zA-Z0-9_]{1,24}", "[ -~]{0,48}"), 0..120).prop_map(|pairs| {
        Message::S2aRules(S2aRules {
            rules: pairs.into_iter().map(|(n, v)| Rule::new(n, v)).collect(),
        })
    })
}

// Property: fragmenting then reassembling in any order yields the same message
proptest! {
    #[test]
    fn prop_fragmentation_preserves_message(
        message in rules_strategy(),
        max_size in 16usize..1400,
        seed in any::<u64>(),
    ) {
        let frame = Frame::from_message(message.clone(), max_size);
        prop_assume!(frame.is_ok());
        let frame = frame.unwrap();

        let mut packets: Vec<Packet> = frame.packets().cloned().collect();
        prop_assert!(packets.iter().all(|p| p.payload().len() <= max_size));

        // Deterministic shuffle driven by the seed
        let len = packets.len();
        for i in (1..len).rev() {
            let j = (seed.wrapping_mul(i as u64 + 7) % (i as u64 + 1)) as usize;
            packets.swap(i, j);
        }

        let registry = Arc::new(MessageRegistry::new());
        let mut iter = packets.into_iter();
        let mut rebuilt = Frame::from_packet(iter.next().unwrap(), registry).unwrap();
        for packet in iter {
            rebuilt.add_packet(packet).unwrap();
        }

        prop_assert!(rebuilt.is_completed());
        prop_assert_eq!(rebuilt.message(), Some(&message));
    }
}

// Property: every datagram on the wire decodes back to the packet that produced it
proptest! {
    #[test]
    fn prop_datagrams_decode_to_packets(message in rules_strategy(), max_size in 32usize..600) {
        if let Ok(frame) = Frame::from_message(message, max_size) {
            for packet in frame.packets() {
                let bytes = packet.to_bytes().unwrap();
                prop_assert_eq!(bytes.len(), packet.wire_len());
                prop_assert_eq!(&Packet::decode(&bytes).unwrap(), packet);
            }
        }
    }
}

// Property: arbitrary bytes never panic the packet or message decoders
proptest! {
    #[test]
    fn prop_decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Packet::decode(&data);
        let registry = MessageRegistry::with_player_ex();
        let _ = registry.decode(&data);
        let _ = Message::decode_builtin(&data);
    }
}

// Property: a set challenge always survives an encode / decode cycle
proptest! {
    #[test]
    fn prop_challenge_survives_wire(challenge in any::<i32>()) {
        for mut command in [
            Message::info_request(),
            Message::rules_request(),
            Message::player_request(),
            Message::player_ex_request(),
        ] {
            command.set_challenge(Some(challenge));
            let bytes = command.to_bytes().unwrap();
            let decoded = MessageRegistry::with_player_ex().decode(&bytes).unwrap();
            prop_assert_eq!(decoded.challenge(), Some(challenge));
        }
    }
}
