//! # Asking Role
//!
//! A [`ClientSession`] sends one command at a time. When the server answers with a challenge
//! the command is stamped and re-emitted; any other reply must pair with the pending command.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::message::Message;
use crate::core::packet::{Packet, DEFAULT_FRAGMENT_SIZE};
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::frame::Frame;
use crate::protocol::session::{Reassembly, SessionState, DEFAULT_REASSEMBLY_DEADLINE};

/// Callback invoked with every accepted reply
pub type ResponseHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Asking side of one remote endpoint
pub struct ClientSession {
    reassembly: Reassembly,
    max_fragment_size: usize,
    challenge: Option<i32>,
    pending_command: Option<Message>,
    response: Option<Message>,
    response_ok: bool,
    on_response: Option<ResponseHook>,
    last_updated: Instant,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("challenge", &self.challenge)
            .field("pending_command", &self.pending_command)
            .field("response_ok", &self.response_ok)
            .finish()
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new(
            Arc::new(MessageRegistry::with_player_ex()),
            DEFAULT_REASSEMBLY_DEADLINE,
            DEFAULT_FRAGMENT_SIZE,
        )
    }
}

impl ClientSession {
    pub fn new(
        registry: Arc<MessageRegistry>,
        reassembly_deadline: Duration,
        max_fragment_size: usize,
    ) -> Self {
        Self {
            reassembly: Reassembly::new(registry, reassembly_deadline),
            max_fragment_size,
            challenge: None,
            pending_command: None,
            response: None,
            response_ok: false,
            on_response: None,
            last_updated: Instant::now(),
        }
    }

    /// Install a callback run after each accepted reply
    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.on_response = Some(hook);
        self
    }

    /// Start a command. The challenge held from earlier exchanges is attached.
    ///
    /// # Errors
    /// `PreviousCommandNotCompleted`, `ChallengeShouldNotBeSet` when the caller filled the
    /// challenge, `UnsupportedMessage` for a non-command.
    pub fn send_command(&mut self, mut command: Message) -> Result<Frame> {
        if self.pending_command.is_some() {
            return Err(ProtocolError::PreviousCommandNotCompleted);
        }
        if command.challenge().is_some() {
            return Err(ProtocolError::ChallengeShouldNotBeSet);
        }
        if !command.is_command() {
            return Err(ProtocolError::UnsupportedMessage(command.header()));
        }

        self.reset();
        if let Some(challenge) = self.challenge {
            command.set_challenge(Some(challenge));
        }
        let frame = Frame::from_message(command.clone(), self.max_fragment_size)?;
        self.pending_command = Some(command);
        Ok(frame)
    }

    /// Handle one complete reply; returns the re-emitted command after a challenge
    pub fn on_message(&mut self, message: Message) -> Result<Option<Frame>> {
        let Some(mut command) = self.pending_command.take() else {
            return Err(ProtocolError::NoPendingCommand);
        };

        if let Message::S2cChallenge(reply) = &message {
            debug!(challenge = reply.challenge, "Received challenge");
            self.challenge = Some(reply.challenge);
            command.set_challenge(Some(reply.challenge));
            let frame = Frame::from_message(command.clone(), self.max_fragment_size);
            self.pending_command = Some(command);
            return frame.map(Some);
        }

        let paired = match (&command, &message) {
            (Message::A2sInfo(_), Message::S2aInfo(_))
            | (Message::A2sRules(_), Message::S2aRules(_))
            | (Message::A2sPlayer(_), Message::S2aPlayer(_))
            | (Message::A2sPlayerEx(_), Message::S2aPlayerEx(_)) => true,
            (
                _,
                Message::S2aInfo(_)
                | Message::S2aRules(_)
                | Message::S2aPlayer(_)
                | Message::S2aPlayerEx(_),
            ) => false,
            _ => return Err(ProtocolError::UnsupportedMessage(message.header())),
        };
        if !paired {
            return Err(ProtocolError::WrongServerResponse {
                request: command.header(),
                response: message.header(),
            });
        }

        if let Some(hook) = &self.on_response {
            hook(&message);
        }
        self.response = Some(message);
        self.response_ok = true;
        Ok(None)
    }

    /// Forget the pending command and the last response; the challenge is kept
    pub fn reset(&mut self) {
        self.pending_command = None;
        self.response = None;
        self.response_ok = false;
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response_ok = false;
        self.response.take()
    }

    pub fn response_ok(&self) -> bool {
        self.response_ok
    }

    pub fn pending_command(&self) -> Option<&Message> {
        self.pending_command.as_ref()
    }

    pub fn challenge(&self) -> Option<i32> {
        self.challenge
    }
}

impl SessionState for ClientSession {
    fn consume_packet(&mut self, packet: Packet) -> Result<Option<Frame>> {
        let Some(message) = self.reassembly.consume(packet)? else {
            return Ok(None);
        };
        let reply = self.on_message(message)?;
        self.last_updated = Instant::now();
        Ok(reply)
    }

    fn last_updated(&self) -> Instant {
        self.last_updated
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::message::{S2aInfo, S2aPlayer, S2aRules};

    #[test]
    fn test_send_command_preconditions() {
        let mut session = ClientSession::default();

        let mut stamped = Message::info_request();
        stamped.set_challenge(Some(12));
        assert!(matches!(
            session.send_command(stamped),
            Err(ProtocolError::ChallengeShouldNotBeSet)
        ));
        assert!(matches!(
            session.send_command(Message::challenge_reply(1)),
            Err(ProtocolError::UnsupportedMessage(0x41))
        ));

        session.send_command(Message::info_request()).unwrap();
        assert!(matches!(
            session.send_command(Message::rules_request()),
            Err(ProtocolError::PreviousCommandNotCompleted)
        ));
    }

    #[test]
    fn test_challenge_is_stamped_and_remembered() {
        let mut session = ClientSession::default();
        session.send_command(Message::rules_request()).unwrap();

        let frame = session
            .on_message(Message::challenge_reply(0x1234))
            .unwrap()
            .unwrap();
        assert_eq!(frame.message().unwrap().challenge(), Some(0x1234));
        assert_eq!(session.pending_command().unwrap().challenge(), Some(0x1234));

        session
            .on_message(Message::S2aRules(S2aRules::default()))
            .unwrap();
        assert!(session.response_ok());
        assert!(session.pending_command().is_none());

        // Next command reuses the held challenge
        let frame = session.send_command(Message::player_request()).unwrap();
        assert_eq!(frame.message().unwrap().challenge(), Some(0x1234));
    }

    #[test]
    fn test_failed_resend_keeps_command() {
        let mut session = ClientSession::new(
            Arc::new(MessageRegistry::new()),
            DEFAULT_REASSEMBLY_DEADLINE,
            DEFAULT_FRAGMENT_SIZE,
        );
        session.send_command(Message::rules_request()).unwrap();
        // A zero fragment size makes every encode fail
        session.max_fragment_size = 0;

        assert!(session.on_message(Message::challenge_reply(77)).is_err());
        assert_eq!(session.pending_command().unwrap().challenge(), Some(77));
        assert_eq!(session.challenge(), Some(77));

        session.max_fragment_size = DEFAULT_FRAGMENT_SIZE;
        let frame = session
            .on_message(Message::challenge_reply(78))
            .unwrap()
            .unwrap();
        assert_eq!(frame.message().unwrap().challenge(), Some(78));
    }

    #[test]
    fn test_mismatched_reply_clears_pending() {
        let mut session = ClientSession::default();
        session.send_command(Message::info_request()).unwrap();

        assert!(matches!(
            session.on_message(Message::S2aPlayer(S2aPlayer::default())),
            Err(ProtocolError::WrongServerResponse {
                request: 0x54,
                response: 0x44
            })
        ));
        assert!(session.pending_command().is_none());
        assert!(!session.response_ok());

        assert!(matches!(
            session.on_message(Message::S2aInfo(S2aInfo::default())),
            Err(ProtocolError::NoPendingCommand)
        ));
    }

    #[test]
    fn test_unknown_reply_unsupported() {
        let mut session = ClientSession::default();
        session.send_command(Message::info_request()).unwrap();
        assert!(matches!(
            session.on_message(Message::rules_request()),
            Err(ProtocolError::UnsupportedMessage(0x56))
        ));
        assert!(session.pending_command().is_none());
    }

    #[test]
    fn test_response_hook_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut session = ClientSession::default().with_response_hook(Arc::new(move |msg: &Message| {
            assert!(matches!(msg, Message::S2aInfo(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        session.send_command(Message::info_request()).unwrap();
        session
            .on_message(Message::S2aInfo(S2aInfo::default()))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(session.response(), Some(Message::S2aInfo(_))));

        session.reset();
        assert!(session.response().is_none());
        assert!(!session.response_ok());
    }
}
