//! # UDP Transport
//!
//! Tokio front ends for both roles. Datagrams go through [`UdpFramed`] with the
//! [`PacketCodec`], so the socket loop only ever sees [`Packet`]s.
//!
//! - [`QueryService`]: socket-free core of the server, one packet in, reply packets out
//! - [`QueryServer`]: binds the query port and drives a [`QueryService`] until shutdown
//! - [`QueryClient`]: sends commands and waits for the paired reply, challenge included

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, warn};

use crate::config::QueryConfig;
use crate::core::codec::{Encodable, PacketCodec};
use crate::core::message::{
    Message, S2aInfo, S2aPlayer, S2aPlayerEx, S2aRules, A2S_INFO_HEADER, A2S_PLAYER_EX_HEADER,
    A2S_PLAYER_HEADER, A2S_RULES_HEADER,
};
use crate::core::packet::Packet;
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::client::ClientSession;
use crate::protocol::frame::Frame;
use crate::protocol::handler::{ClientSessionHandler, ServerSessionHandler};
use crate::protocol::server::CommandHandler;
use crate::utils::metrics::{Metrics, Timer};

fn parse_addr(value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| ProtocolError::ConfigError(format!("Invalid socket address {value:?}: {e}")))
}

/// Server side packet processing shared by every datagram of a socket
#[derive(Debug, Clone)]
pub struct QueryService {
    sessions: Arc<ServerSessionHandler>,
    metrics: Arc<Metrics>,
}

impl QueryService {
    pub fn new(sessions: Arc<ServerSessionHandler>, metrics: Arc<Metrics>) -> Self {
        Self { sessions, metrics }
    }

    pub fn sessions(&self) -> &Arc<ServerSessionHandler> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Raw datagram entry point for callers that own their socket
    pub fn on_datagram_received(&self, addr: SocketAddr, datagram: &[u8]) -> Vec<(SocketAddr, Bytes)> {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.datagram_received(datagram.len() as u64);
                self.metrics.decode_error();
                debug!(%addr, error = %e, "Dropped undecodable datagram");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for reply in self.on_packet(addr, packet) {
            match reply.to_bytes() {
                Ok(bytes) => out.push((addr, bytes)),
                Err(e) => {
                    warn!(%addr, error = %e, "Failed to encode reply");
                    return Vec::new();
                }
            }
        }
        out
    }

    /// Feed one packet from `addr`; returns the packets to send back, possibly none
    ///
    /// Rejected packets are counted and logged, never propagated.
    pub fn on_packet(&self, addr: SocketAddr, packet: Packet) -> Vec<Packet> {
        let _timer = Timer::start("query_packet");
        self.metrics.datagram_received(packet.wire_len() as u64);
        let fragment = packet.is_long();

        match self.sessions.consume(addr, packet) {
            Ok(Some(frame)) => {
                if fragment {
                    self.metrics.frame_reassembled();
                }
                match frame.message() {
                    Some(Message::S2cChallenge(_)) => self.metrics.challenge_issued(),
                    _ => self.metrics.reply_sent(),
                }
                frame.packets().cloned().collect()
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                self.metrics.session_error();
                debug!(%addr, error = %e, "Rejected query");
                Vec::new()
            }
        }
    }
}

/// Query port listener
pub struct QueryServer {
    framed: UdpFramed<PacketCodec>,
    service: QueryService,
    local_addr: SocketAddr,
    metrics_interval: Duration,
    sweep_interval: Duration,
}

impl QueryServer {
    /// Bind `config.server.address`, answering through `handler`
    ///
    /// The message registry knows the player-ex extension.
    pub async fn bind(config: &QueryConfig, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        Self::bind_with_registry(config, handler, Arc::new(MessageRegistry::with_player_ex())).await
    }

    #[instrument(skip_all, fields(address = %config.server.address))]
    pub async fn bind_with_registry(
        config: &QueryConfig,
        handler: Arc<dyn CommandHandler>,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let socket = UdpSocket::bind(parse_addr(&config.server.address)?).await?;
        let local_addr = socket.local_addr()?;

        let sessions = ServerSessionHandler::for_server(
            config.server_settings(),
            handler,
            registry,
            config.session.session_ttl,
        );
        info!(%local_addr, "Query server listening");

        Ok(Self {
            framed: UdpFramed::new(socket, PacketCodec),
            service: QueryService::new(Arc::new(sessions), Arc::new(Metrics::new())),
            local_addr,
            metrics_interval: config.server.metrics_interval,
            sweep_interval: config.session.sweep_interval,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.service.metrics)
    }

    pub fn sessions(&self) -> Arc<ServerSessionHandler> {
        Arc::clone(&self.service.sessions)
    }

    /// Serve until CTRL+C
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Serve until `shutdown_rx` yields or its sender is dropped
    #[instrument(skip_all, fields(local_addr = %self.local_addr))]
    pub async fn run_with_shutdown(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let report = !self.metrics_interval.is_zero();
        let mut ticker = tokio::time::interval(self.metrics_interval.max(Duration::from_millis(1)));
        let mut sweeper = tokio::time::interval(self.sweep_interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down query server");
                    self.service.metrics.log_metrics();
                    return Ok(());
                }

                _ = ticker.tick(), if report => {
                    self.service.metrics.log_metrics();
                }

                _ = sweeper.tick() => {
                    match self.service.sessions.sweep() {
                        Ok(removed) if removed > 0 => debug!(removed, "Swept idle query sessions"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Session sweep failed"),
                    }
                }

                next = self.framed.next() => match next {
                    Some(Ok((packet, addr))) => {
                        let replies = self.service.on_packet(addr, packet);
                        self.send(addr, replies).await;
                    }
                    Some(Err(ProtocolError::Io(e))) => {
                        self.service.metrics.io_error();
                        warn!(error = %e, "Query socket receive failed");
                    }
                    Some(Err(e)) => {
                        self.service.metrics.decode_error();
                        debug!(error = %e, "Dropped undecodable datagram");
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    async fn send(&mut self, addr: SocketAddr, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        for packet in packets {
            let len = packet.wire_len() as u64;
            if let Err(e) = self.framed.feed((packet, addr)).await {
                self.service.metrics.io_error();
                warn!(%addr, error = %e, "Failed to queue reply");
                return;
            }
            self.service.metrics.datagram_sent(len);
        }
        if let Err(e) = self.framed.flush().await {
            self.service.metrics.io_error();
            warn!(%addr, error = %e, "Failed to send reply");
        }
    }
}

/// Asking side over one local socket, any number of servers
pub struct QueryClient {
    framed: UdpFramed<PacketCodec>,
    sessions: ClientSessionHandler,
    response_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl QueryClient {
    pub async fn bind(config: &QueryConfig) -> Result<Self> {
        Self::bind_with_registry(config, Arc::new(MessageRegistry::with_player_ex())).await
    }

    pub async fn bind_with_registry(
        config: &QueryConfig,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let socket = UdpSocket::bind(parse_addr(&config.client.bind_address)?).await?;
        debug!(local_addr = ?socket.local_addr(), "Query client bound");

        Ok(Self {
            framed: UdpFramed::new(socket, PacketCodec),
            sessions: ClientSessionHandler::for_client(registry, config.client_settings()),
            response_timeout: config.client.response_timeout,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Challenge currently held for `addr`
    pub fn challenge(&self, addr: SocketAddr) -> Result<Option<i32>> {
        Ok(self.sessions.session(addr, |s| s.challenge())?.flatten())
    }

    /// Send `command` to `addr` and wait for its reply
    ///
    /// # Errors
    /// `Timeout` when no paired reply arrives within the response timeout, any session
    /// error raised by the replies, or a socket failure.
    #[instrument(level = "debug", skip(self, command), fields(kind = command.kind_name()))]
    pub async fn query(&mut self, addr: SocketAddr, command: Message) -> Result<Message> {
        let frame = self.sessions.send_command(addr, command)?;
        if let Err(e) = self.send_frame(addr, frame).await {
            self.abandon(addr);
            return Err(e);
        }

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let next = match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => {
                    self.abandon(addr);
                    return Err(ProtocolError::Timeout);
                }
            };

            let (packet, from) = match next {
                Some(Ok(item)) => item,
                Some(Err(ProtocolError::Io(e))) => {
                    self.metrics.io_error();
                    self.abandon(addr);
                    return Err(e.into());
                }
                Some(Err(e)) => {
                    self.metrics.decode_error();
                    debug!(error = %e, "Dropped undecodable datagram");
                    continue;
                }
                None => {
                    self.abandon(addr);
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "query socket closed").into());
                }
            };
            self.metrics.datagram_received(packet.wire_len() as u64);

            if from != addr {
                debug!(%from, expected = %addr, "Ignoring datagram from unexpected peer");
                continue;
            }

            match self.sessions.consume(addr, packet) {
                Ok(Some(resend)) => {
                    if let Err(e) = self.send_frame(addr, resend).await {
                        self.abandon(addr);
                        return Err(e);
                    }
                }
                Ok(None) => {
                    if let Some(response) = self.sessions.session(addr, |s| s.take_response())?.flatten() {
                        self.metrics.reply_received();
                        return Ok(response);
                    }
                }
                Err(e) => {
                    self.metrics.session_error();
                    self.abandon(addr);
                    return Err(e);
                }
            }
        }
    }

    pub async fn info(&mut self, addr: SocketAddr) -> Result<S2aInfo> {
        match self.query(addr, Message::info_request()).await? {
            Message::S2aInfo(info) => Ok(info),
            other => Err(ProtocolError::WrongServerResponse {
                request: A2S_INFO_HEADER,
                response: other.header(),
            }),
        }
    }

    pub async fn rules(&mut self, addr: SocketAddr) -> Result<S2aRules> {
        match self.query(addr, Message::rules_request()).await? {
            Message::S2aRules(rules) => Ok(rules),
            other => Err(ProtocolError::WrongServerResponse {
                request: A2S_RULES_HEADER,
                response: other.header(),
            }),
        }
    }

    pub async fn players(&mut self, addr: SocketAddr) -> Result<S2aPlayer> {
        match self.query(addr, Message::player_request()).await? {
            Message::S2aPlayer(players) => Ok(players),
            other => Err(ProtocolError::WrongServerResponse {
                request: A2S_PLAYER_HEADER,
                response: other.header(),
            }),
        }
    }

    pub async fn players_ex(&mut self, addr: SocketAddr) -> Result<S2aPlayerEx> {
        match self.query(addr, Message::player_ex_request()).await? {
            Message::S2aPlayerEx(players) => Ok(players),
            other => Err(ProtocolError::WrongServerResponse {
                request: A2S_PLAYER_EX_HEADER,
                response: other.header(),
            }),
        }
    }

    async fn send_frame(&mut self, addr: SocketAddr, frame: Frame) -> Result<()> {
        for packet in frame.packets() {
            let len = packet.wire_len() as u64;
            self.framed.feed((packet.clone(), addr)).await?;
            self.metrics.datagram_sent(len);
        }
        self.framed.flush().await
    }

    /// Drop the pending command so the next query can start
    fn abandon(&self, addr: SocketAddr) {
        if let Err(e) = self.sessions.session(addr, ClientSession::reset) {
            warn!(%addr, error = %e, "Failed to reset query session");
        }
    }
}
