//! # Sessions
//!
//! Per-endpoint protocol state. Both roles share the same packet consumption rules:
//!
//! 1. A pending frame that outlived the reassembly deadline is dropped
//! 2. With a pending frame, a long packet is added to it; any other packet aborts it
//!    with `WrongPacketSequence`
//! 3. Without a pending frame, the packet seeds a new one
//! 4. A completed frame is taken out and its message handed to the role
//!
//! Errors at any step leave the session without a pending frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::core::message::Message;
use crate::core::packet::Packet;
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::client::ClientSession;
use crate::protocol::frame::Frame;
use crate::protocol::server::ServerSession;

/// Default time a partially received message may wait for its remaining fragments
pub const DEFAULT_REASSEMBLY_DEADLINE: Duration = Duration::from_secs(5);

/// State a [`SessionHandler`](crate::protocol::handler::SessionHandler) can store per endpoint
pub trait SessionState: Send {
    /// Feed one received packet, returning a frame to send back if any
    fn consume_packet(&mut self, packet: Packet) -> Result<Option<Frame>>;

    /// Time of the last successfully handled message
    fn last_updated(&self) -> Instant;
}

/// Pending-frame bookkeeping shared by both roles
#[derive(Debug)]
pub struct Reassembly {
    registry: Arc<MessageRegistry>,
    deadline: Duration,
    pending: Option<Frame>,
}

impl Reassembly {
    pub fn new(registry: Arc<MessageRegistry>, deadline: Duration) -> Self {
        Self {
            registry,
            deadline,
            pending: None,
        }
    }

    /// Apply one packet; returns the message once its frame is complete
    pub fn consume(&mut self, packet: Packet) -> Result<Option<Message>> {
        if self
            .pending
            .as_ref()
            .is_some_and(|frame| frame.is_expired(self.deadline))
        {
            let frame = self.pending.take();
            warn!(
                id = ?frame.as_ref().and_then(Frame::id),
                error = %ProtocolError::FrameExpired,
                "Dropping stalled reassembly"
            );
        }

        let frame = match self.pending.take() {
            Some(mut frame) => {
                if !packet.is_long() {
                    return Err(ProtocolError::WrongPacketSequence);
                }
                frame.add_packet(packet)?;
                frame
            }
            None => Frame::from_packet(packet, Arc::clone(&self.registry))?,
        };

        if frame.is_completed() {
            Ok(frame.into_message())
        } else {
            self.pending = Some(frame);
            Ok(None)
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }
}

/// Either role, for storage that must hold both
#[derive(Debug)]
pub enum Session {
    Server(ServerSession),
    Client(ClientSession),
}

impl Session {
    pub fn as_server(&self) -> Option<&ServerSession> {
        match self {
            Session::Server(session) => Some(session),
            Session::Client(_) => None,
        }
    }

    pub fn as_client(&self) -> Option<&ClientSession> {
        match self {
            Session::Client(session) => Some(session),
            Session::Server(_) => None,
        }
    }

    pub fn as_client_mut(&mut self) -> Option<&mut ClientSession> {
        match self {
            Session::Client(session) => Some(session),
            Session::Server(_) => None,
        }
    }
}

impl SessionState for Session {
    fn consume_packet(&mut self, packet: Packet) -> Result<Option<Frame>> {
        match self {
            Session::Server(session) => session.consume_packet(packet),
            Session::Client(session) => session.consume_packet(packet),
        }
    }

    fn last_updated(&self) -> Instant {
        match self {
            Session::Server(session) => session.last_updated(),
            Session::Client(session) => session.last_updated(),
        }
    }
}

impl From<ServerSession> for Session {
    fn from(session: ServerSession) -> Self {
        Session::Server(session)
    }
}

impl From<ClientSession> for Session {
    fn from(session: ClientSession) -> Self {
        Session::Client(session)
    }
}
