//! # Answering Role
//!
//! A [`ServerSession`] guards every command behind a challenge. A client first receives an
//! `S2C_CHALLENGE`, then repeats its command carrying that value. The challenge is replaced
//! when the session has been idle for `challenge_update_ttl` or the challenge is older than
//! `challenge_creation_ttl`.
//!
//! Replies are produced by a [`CommandHandler`], shared by every session of a server.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, instrument};

use crate::core::message::{A2sInfo, Message, CHALLENGE_REQUEST, DEFAULT_INFO_PAYLOAD};
use crate::core::packet::{Packet, DEFAULT_FRAGMENT_SIZE};
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::frame::Frame;
use crate::protocol::session::{Reassembly, SessionState, DEFAULT_REASSEMBLY_DEADLINE};

/// Produces the reply frames of a server
pub trait CommandHandler: Send + Sync {
    /// Reply to an `A2S_INFO` whose payload has already been checked
    fn info(&self, request: &A2sInfo) -> Result<Frame>;

    fn rules(&self) -> Result<Frame>;

    fn players(&self) -> Result<Frame>;

    /// Reply to any other command; `None` rejects it as unsupported
    fn custom(&self, _request: &Message) -> Option<Result<Frame>> {
        None
    }
}

/// Server session tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Idle time after which the next command gets a fresh challenge
    pub challenge_update_ttl: Duration,
    /// Maximum challenge age
    pub challenge_creation_ttl: Duration,
    pub check_info_payload: bool,
    pub expected_info_payload: String,
    pub reassembly_deadline: Duration,
    pub max_fragment_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            challenge_update_ttl: Duration::from_secs(30),
            challenge_creation_ttl: Duration::from_secs(300),
            check_info_payload: true,
            expected_info_payload: DEFAULT_INFO_PAYLOAD.to_string(),
            reassembly_deadline: DEFAULT_REASSEMBLY_DEADLINE,
            max_fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

/// Answering side of one remote endpoint
pub struct ServerSession {
    settings: Arc<ServerSettings>,
    handler: Arc<dyn CommandHandler>,
    reassembly: Reassembly,
    challenge: Option<i32>,
    challenge_created: Instant,
    last_updated: Instant,
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("challenge", &self.challenge)
            .field("pending", &self.reassembly.has_pending())
            .field("last_updated", &self.last_updated)
            .finish()
    }
}

impl ServerSession {
    pub fn new(
        settings: Arc<ServerSettings>,
        handler: Arc<dyn CommandHandler>,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        let now = Instant::now();
        let reassembly = Reassembly::new(registry, settings.reassembly_deadline);
        Self {
            settings,
            handler,
            reassembly,
            challenge: None,
            challenge_created: now,
            last_updated: now,
        }
    }

    /// Current challenge, if one was issued
    pub fn challenge(&self) -> Option<i32> {
        self.challenge
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Pretend the session has been idle past its update TTL
    pub fn force_expire_activity(&mut self) {
        let idle = self.settings.challenge_update_ttl + Duration::from_secs(1);
        match Instant::now().checked_sub(idle) {
            Some(past) => self.last_updated = past,
            None => self.challenge = None,
        }
    }

    /// Pretend the challenge is older than its creation TTL
    pub fn force_expire_challenge(&mut self) {
        let age = self.settings.challenge_creation_ttl + Duration::from_secs(1);
        match Instant::now().checked_sub(age) {
            Some(past) => self.challenge_created = past,
            None => self.challenge = None,
        }
    }

    fn challenge_expired(&self) -> bool {
        self.challenge.is_none()
            || self.last_updated.elapsed() > self.settings.challenge_update_ttl
            || self.challenge_created.elapsed() > self.settings.challenge_creation_ttl
    }

    fn issue_challenge(&mut self) -> Result<Frame> {
        let challenge = draw_challenge(&mut rand::rng(), self.challenge);
        self.challenge = Some(challenge);
        self.challenge_created = Instant::now();
        debug!(challenge, "Issued challenge");
        Frame::from_message(
            Message::challenge_reply(challenge),
            self.settings.max_fragment_size,
        )
    }

    /// Decide the reply to one complete message
    #[instrument(level = "debug", skip_all, fields(kind = message.kind_name()))]
    pub fn on_message(&mut self, message: Message) -> Result<Frame> {
        if self.challenge_expired() {
            return self.issue_challenge();
        }
        if !message.is_command() {
            return Err(ProtocolError::UnsupportedMessage(message.header()));
        }

        match message.challenge() {
            Some(value) if Some(value) == self.challenge => self.process(&message),
            None | Some(CHALLENGE_REQUEST) => self.issue_challenge(),
            Some(_) => Err(ProtocolError::WrongChallenge),
        }
    }

    fn process(&self, message: &Message) -> Result<Frame> {
        match message {
            Message::A2sInfo(request) => {
                if self.settings.check_info_payload
                    && request.payload != self.settings.expected_info_payload
                {
                    return Err(ProtocolError::WrongA2SInfoPayload(request.payload.clone()));
                }
                self.handler.info(request)
            }
            Message::A2sRules(_) => self.handler.rules(),
            Message::A2sPlayer(_) => self.handler.players(),
            other => self
                .handler
                .custom(other)
                .unwrap_or(Err(ProtocolError::UnsupportedMessage(other.header()))),
        }
    }
}

/// Random challenge that is neither the request marker nor the value being replaced
fn draw_challenge<R: Rng>(rng: &mut R, previous: Option<i32>) -> i32 {
    loop {
        let candidate: i32 = rng.random();
        if candidate != CHALLENGE_REQUEST && Some(candidate) != previous {
            return candidate;
        }
    }
}

impl SessionState for ServerSession {
    fn consume_packet(&mut self, packet: Packet) -> Result<Option<Frame>> {
        let Some(message) = self.reassembly.consume(packet)? else {
            return Ok(None);
        };
        let reply = self.on_message(message)?;
        self.last_updated = Instant::now();
        Ok(Some(reply))
    }

    fn last_updated(&self) -> Instant {
        self.last_updated
    }
}
