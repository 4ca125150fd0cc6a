//! Session level flows: fragmentation of large replies, command overlap, idle expiry

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use source_query_protocol::core::message::{A2sInfo, Rule, S2aInfo, S2aPlayer, S2aRules};
use source_query_protocol::core::packet::Packet;
use source_query_protocol::core::registry::MessageRegistry;
use source_query_protocol::error::ProtocolError;
use source_query_protocol::protocol::client::ClientSession;
use source_query_protocol::protocol::handler::{
    ClientSessionHandler, ClientSettings, ServerSessionHandler,
};
use source_query_protocol::protocol::server::{CommandHandler, ServerSettings};
use source_query_protocol::protocol::session::{Session, SessionState};
use source_query_protocol::{Frame, Message, Result};

fn many_rules(count: usize) -> S2aRules {
    S2aRules {
        rules: (0..count)
            .map(|i| Rule::new(format!("key_{i:03}"), format!("value number {i}")))
            .collect(),
    }
}

struct RulesOnly;

impl CommandHandler for RulesOnly {
    fn info(&self, _request: &A2sInfo) -> Result<Frame> {
        Frame::from_message(Message::S2aInfo(S2aInfo::default()), 1248)
    }

    fn rules(&self) -> Result<Frame> {
        Frame::from_message(Message::S2aRules(many_rules(255)), 1248)
    }

    fn players(&self) -> Result<Frame> {
        Frame::from_message(Message::S2aPlayer(S2aPlayer::default()), 1248)
    }
}

fn server(idle_ttl: Duration) -> ServerSessionHandler {
    ServerSessionHandler::for_server(
        ServerSettings::default(),
        Arc::new(RulesOnly),
        Arc::new(MessageRegistry::new()),
        idle_ttl,
    )
}

fn first_packet(message: Message) -> Packet {
    Frame::from_message(message, 1248)
        .unwrap()
        .packets()
        .next()
        .unwrap()
        .clone()
}

fn challenge_from(frame: Option<Frame>) -> i32 {
    match frame.and_then(Frame::into_message) {
        Some(Message::S2cChallenge(reply)) => reply.challenge,
        other => panic!("expected a challenge, got {other:?}"),
    }
}

#[test]
fn test_255_rules_fragment_and_reassemble_in_reverse() {
    let reply = Message::S2aRules(many_rules(255));
    let frame = Frame::from_message(reply.clone(), 1248).unwrap();
    assert!(frame.total() > 1);

    let mut client = ClientSession::default();
    client.send_command(Message::rules_request()).unwrap();

    let packets: Vec<Packet> = frame.packets().cloned().collect();
    for packet in packets.into_iter().rev() {
        assert!(client.consume_packet(packet).unwrap().is_none());
    }

    assert!(client.response_ok());
    match client.response() {
        Some(Message::S2aRules(rules)) => {
            assert_eq!(rules.rules.len(), 255);
            assert_eq!(rules.rules[0].name, "key_000");
            assert_eq!(rules.rules[254].value, "value number 254");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.response(), Some(&reply));
}

#[test]
fn test_distinct_endpoints_get_independent_challenges() {
    let server = server(Duration::from_secs(60));
    let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
    let b: SocketAddr = "192.0.2.2:1000".parse().unwrap();

    let ca = challenge_from(server.consume(a, first_packet(Message::info_request())).unwrap());
    let cb = challenge_from(server.consume(b, first_packet(Message::info_request())).unwrap());

    assert_eq!(server.session(a, |s| s.challenge()).unwrap(), Some(Some(ca)));
    assert_eq!(server.session(b, |s| s.challenge()).unwrap(), Some(Some(cb)));

    // Each challenge only works from its own endpoint
    let mut stolen = Message::rules_request();
    stolen.set_challenge(Some(ca));
    if ca != cb {
        assert!(matches!(
            server.consume(b, first_packet(stolen)),
            Err(ProtocolError::WrongChallenge)
        ));
    }
}

#[test]
fn test_outstanding_command_blocks_until_reset() {
    let client = ClientSessionHandler::for_client(
        Arc::new(MessageRegistry::new()),
        ClientSettings::default(),
    );
    let addr: SocketAddr = "192.0.2.9:27015".parse().unwrap();

    client.send_command(addr, Message::info_request()).unwrap();
    assert!(matches!(
        client.send_command(addr, Message::rules_request()),
        Err(ProtocolError::PreviousCommandNotCompleted)
    ));

    client.session(addr, ClientSession::reset).unwrap();
    client.send_command(addr, Message::rules_request()).unwrap();
}

#[test]
fn test_full_exchange_with_response_hook() {
    let server = server(Duration::from_secs(60));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let mut client = ClientSession::default().with_response_hook(Arc::new(move |m: &Message| {
        hook_seen.lock().unwrap().push(m.header());
    }));
    let peer: SocketAddr = "192.0.2.5:5000".parse().unwrap();

    let mut outgoing = client.send_command(Message::rules_request()).unwrap();
    while !client.response_ok() {
        let mut reply = None;
        for packet in outgoing.packets().cloned() {
            reply = server.consume(peer, packet).unwrap();
        }
        let reply = reply.expect("server answers every complete command");
        let mut resend = None;
        for packet in reply.packets().cloned() {
            resend = client.consume_packet(packet).unwrap();
        }
        if let Some(frame) = resend {
            outgoing = frame;
        }
    }

    assert_eq!(*seen.lock().unwrap(), vec![0x45]);
    assert!(client.challenge().is_some());
}

#[test]
fn test_idle_sessions_swept() {
    let server = server(Duration::from_millis(20));
    let addr: SocketAddr = "192.0.2.3:2000".parse().unwrap();
    server.consume(addr, first_packet(Message::info_request())).unwrap();
    assert!(server.contains(addr));

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(server.sweep().unwrap(), 1);
    assert!(!server.contains(addr));
    assert!(server.is_empty());
}

#[test]
fn test_session_enum_dispatches_by_role() {
    let mut session = Session::from(ClientSession::default());
    let packet = first_packet(Message::challenge_reply(1));
    assert!(matches!(
        session.consume_packet(packet),
        Err(ProtocolError::NoPendingCommand)
    ));
}
