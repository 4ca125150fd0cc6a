#![allow(clippy::unwrap_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use source_query_protocol::core::registry::MessageRegistry;
use source_query_protocol::protocol::handler::ServerSessionHandler;
use source_query_protocol::protocol::server::ServerSettings;
use source_query_protocol::protocol::stats::{GameStats, StatsReplyBuilder};
use source_query_protocol::transport::reply_cache::ReplyCache;
use source_query_protocol::{Frame, Message};
use tokio::task::JoinSet;

fn shared_server() -> Arc<ServerSessionHandler> {
    let stats = Arc::new(RwLock::new(GameStats {
        server_name: "load".into(),
        ..GameStats::default()
    }));
    let builder = StatsReplyBuilder::new(stats)
        .with_cache(Arc::new(ReplyCache::new(Duration::from_secs(5))));
    Arc::new(ServerSessionHandler::for_server(
        ServerSettings::default(),
        Arc::new(builder),
        Arc::new(MessageRegistry::with_player_ex()),
        Duration::from_secs(60),
    ))
}

fn packet_of(message: Message) -> source_query_protocol::Packet {
    Frame::from_message(message, 1248)
        .unwrap()
        .packets()
        .next()
        .unwrap()
        .clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_endpoints_each_get_their_own_challenge() {
    let server = shared_server();
    let endpoints = 64u16;
    let rounds = 50usize;

    let mut tasks = JoinSet::new();
    for port in 0..endpoints {
        let server = server.clone();
        tasks.spawn(async move {
            let addr: SocketAddr = format!("10.1.0.1:{}", 20_000 + port).parse().unwrap();

            let challenge = match server
                .consume(addr, packet_of(Message::rules_request()))
                .unwrap()
                .and_then(Frame::into_message)
            {
                Some(Message::S2cChallenge(reply)) => reply.challenge,
                other => panic!("expected a challenge, got {other:?}"),
            };

            for _ in 0..rounds {
                let mut command = Message::rules_request();
                command.set_challenge(Some(challenge));
                let reply = server.consume(addr, packet_of(command)).unwrap().unwrap();
                assert!(matches!(reply.message(), Some(Message::S2aRules(_))));
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert_eq!(server.len(), usize::from(endpoints));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_runs_alongside_traffic() {
    let server = shared_server();
    let mut tasks = JoinSet::new();

    for worker in 0..4u16 {
        let server = server.clone();
        tasks.spawn(async move {
            for i in 0..500u16 {
                let addr: SocketAddr = format!("10.2.{worker}.1:{}", 1024 + i).parse().unwrap();
                server.consume(addr, packet_of(Message::info_request())).unwrap();
            }
        });
    }
    let sweeper = server.clone();
    tasks.spawn(async move {
        for _ in 0..200 {
            sweeper.sweep().unwrap();
            tokio::task::yield_now().await;
        }
    });

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    // Nothing is idle past the TTL, so every session survives
    assert_eq!(server.len(), 2000);
}
