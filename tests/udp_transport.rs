//! Loopback tests for the Tokio UDP server and client

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use source_query_protocol::config::QueryConfig;
use source_query_protocol::core::field::{fields, FieldValue};
use source_query_protocol::error::ProtocolError;
use source_query_protocol::protocol::handler::ServerSessionHandler;
use source_query_protocol::protocol::stats::{GameStats, PlayerStats, StatsReplyBuilder};
use source_query_protocol::transport::udp::{QueryClient, QueryServer};
use source_query_protocol::utils::Metrics;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn loopback_config(max_fragment_size: usize) -> QueryConfig {
    QueryConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.metrics_interval = Duration::ZERO;
        c.client.bind_address = "127.0.0.1:0".into();
        c.client.response_timeout = Duration::from_secs(2);
        c.session.max_fragment_size = max_fragment_size;
    })
}

fn game(players: usize) -> GameStats {
    GameStats {
        server_name: "Loopback".into(),
        map: "Carthag".into(),
        max_players: 32,
        players: (0..players)
            .map(|i| PlayerStats {
                index: i as i32,
                name: format!("pilot-{i}"),
                faction: "Harkonnen".into(),
                ..PlayerStats::default()
            })
            .collect(),
        ..GameStats::default()
    }
}

struct Running {
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    sessions: Arc<ServerSessionHandler>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<source_query_protocol::Result<()>>,
}

async fn start(config: &QueryConfig, stats: GameStats) -> Running {
    let builder = StatsReplyBuilder::from_config(Arc::new(RwLock::new(stats)), config);
    let server = QueryServer::bind(config, Arc::new(builder)).await.unwrap();
    let addr = server.local_addr();
    let metrics = server.metrics();
    let sessions = server.sessions();
    let (shutdown, rx) = mpsc::channel(1);
    let task = tokio::spawn(server.run_with_shutdown(rx));
    Running {
        addr,
        metrics,
        sessions,
        shutdown,
        task,
    }
}

#[tokio::test]
async fn test_info_and_rules_over_loopback() {
    let config = loopback_config(1248);
    let server = start(&config, game(3)).await;
    let mut client = QueryClient::bind(&config).await.unwrap();

    let info = client.info(server.addr).await.unwrap();
    assert_eq!(info.name, "Loopback");
    assert_eq!(info.map, "Carthag");
    assert_eq!(info.players, 3);
    assert_eq!(info.max_players, 32);
    assert!(client.challenge(server.addr).unwrap().is_some());

    let rules = client.rules(server.addr).await.unwrap();
    assert_eq!(rules.rules[0].name, "ServerState");

    let players = client.players(server.addr).await.unwrap();
    assert_eq!(players.players.len(), 3);

    server.shutdown.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();

    let snapshot = server.metrics.snapshot();
    // One challenge, then three replies on the same challenge
    assert_eq!(snapshot.challenges_issued, 1);
    assert_eq!(snapshot.replies_sent, 3);
    assert_eq!(snapshot.total_errors(), 0);

    let client_side = client.metrics().snapshot();
    assert_eq!(client_side.replies_received, 3);
    assert_eq!(client_side.replies_sent, 0);
}

#[tokio::test]
async fn test_idle_sessions_swept_without_metrics() {
    let mut config = loopback_config(1248);
    config.session.session_ttl = Duration::from_millis(200);
    config.session.sweep_interval = Duration::from_millis(20);
    let server = start(&config, game(1)).await;

    let mut client = QueryClient::bind(&config).await.unwrap();
    client.info(server.addr).await.unwrap();
    assert_eq!(server.sessions.len(), 1);

    // No further traffic reaches the server
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(server.sessions.is_empty());

    server.shutdown.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fragmented_player_ex_over_loopback() {
    let config = loopback_config(128);
    let server = start(&config, game(24)).await;
    let mut client = QueryClient::bind(&config).await.unwrap();

    let reply = client.players_ex(server.addr).await.unwrap();
    assert_eq!(reply.players.len(), 24);
    assert_eq!(
        reply.players[23]
            .field(&fields::FACTION)
            .map(|f| f.value().clone()),
        Some(FieldValue::Str("Harkonnen".into()))
    );
    assert!(client.metrics().snapshot().datagrams_received > 2);

    drop(server.shutdown);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let config = QueryConfig::default_with_overrides(|c| {
        c.client.bind_address = "127.0.0.1:0".into();
        c.client.response_timeout = Duration::from_millis(150);
    });
    let mut client = QueryClient::bind(&config).await.unwrap();

    assert!(matches!(
        client.info(addr).await,
        Err(ProtocolError::Timeout)
    ));
    // The abandoned command does not block the next one
    assert!(matches!(
        client.rules(addr).await,
        Err(ProtocolError::Timeout)
    ));
}

#[tokio::test]
async fn test_garbage_datagrams_are_counted_and_ignored() {
    let config = loopback_config(1248);
    let server = start(&config, game(1)).await;

    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise.send_to(&[0x01, 0x02, 0x03], server.addr).await.unwrap();
    noise
        .send_to(&[0xFF, 0xFF, 0xFF, 0xFF, 0x99], server.addr)
        .await
        .unwrap();

    // The server still answers afterwards
    let mut client = QueryClient::bind(&config).await.unwrap();
    client.info(server.addr).await.unwrap();

    server.shutdown.send(()).await.unwrap();
    server.task.await.unwrap().unwrap();

    let snapshot = server.metrics.snapshot();
    assert_eq!(snapshot.decode_errors, 1);
    assert_eq!(snapshot.session_errors, 1);
}

#[tokio::test]
async fn test_invalid_config_refused_at_bind() {
    let config = QueryConfig::default_with_overrides(|c| {
        c.server.address = "nowhere".into();
    });
    let builder = StatsReplyBuilder::new(Arc::new(RwLock::new(GameStats::default())));
    assert!(matches!(
        QueryServer::bind(&config, Arc::new(builder)).await,
        Err(ProtocolError::ConfigError(_))
    ));
}
