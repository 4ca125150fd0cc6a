//! # Session Handlers
//!
//! Registries of per-endpoint sessions, keyed by remote socket address. A
//! [`PeerSessionHandler`] keeps either role per endpoint: whoever writes first is answered,
//! whoever we query first is asked.
//!
//! ## Locking
//! - The map lock is held only to sweep idle sessions and to fetch or create a slot
//! - Each session has its own lock, taken after the map lock is released
//! - A slot in use is never swept; its user count is released by a drop guard on every path
//!
//! ## Usage
//! ```rust
//! use std::sync::Arc;
//! use source_query_protocol::core::registry::MessageRegistry;
//! use source_query_protocol::protocol::handler::ClientSessionHandler;
//! use source_query_protocol::Message;
//!
//! let handler = ClientSessionHandler::for_client(Arc::new(MessageRegistry::new()), Default::default());
//! let addr = "127.0.0.1:27015".parse().unwrap();
//! let frame = handler.send_command(addr, Message::info_request()).unwrap();
//! assert!(frame.is_completed());
//! assert!(handler.contains(addr));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::message::Message;
use crate::core::packet::{Packet, DEFAULT_FRAGMENT_SIZE};
use crate::core::registry::MessageRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::client::ClientSession;
use crate::protocol::frame::Frame;
use crate::protocol::server::{CommandHandler, ServerSession, ServerSettings};
use crate::protocol::session::{Session, SessionState, DEFAULT_REASSEMBLY_DEADLINE};

/// Default idle time after which a session is forgotten
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Builds the session of a newly seen endpoint
pub type SessionFactory<S> = Arc<dyn Fn(SocketAddr) -> S + Send + Sync>;

struct SessionSlot<S> {
    session: Mutex<S>,
    users: AtomicUsize,
}

/// Releases a slot's use count when dropped
struct InUseGuard<'a>(&'a AtomicUsize);

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Client side tuning shared by the sessions of a [`ClientSessionHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub reassembly_deadline: Duration,
    pub max_fragment_size: usize,
    pub session_ttl: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reassembly_deadline: DEFAULT_REASSEMBLY_DEADLINE,
            max_fragment_size: DEFAULT_FRAGMENT_SIZE,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

/// Endpoint to session registry
pub struct SessionHandler<S> {
    sessions: Mutex<HashMap<SocketAddr, Arc<SessionSlot<S>>>>,
    factory: SessionFactory<S>,
    /// Builds sessions for endpoints first reached by a local command
    opener: Option<SessionFactory<S>>,
    idle_ttl: Duration,
}

/// Registry of answering sessions
pub type ServerSessionHandler = SessionHandler<ServerSession>;

/// Registry of asking sessions
pub type ClientSessionHandler = SessionHandler<ClientSession>;

/// Registry holding either role per endpoint on a socket that both asks and answers
pub type PeerSessionHandler = SessionHandler<Session>;

impl<S: SessionState> fmt::Debug for SessionHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("sessions", &self.len())
            .field("idle_ttl", &self.idle_ttl)
            .finish()
    }
}

impl<S: SessionState> SessionHandler<S> {
    pub fn new(factory: SessionFactory<S>, idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            opener: None,
            idle_ttl,
        }
    }

    /// Build sessions opened by [`SessionHandler::with_opened_session`] with `opener`
    pub fn with_opener(mut self, opener: SessionFactory<S>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Feed a packet from `addr` to its session, creating the session on first contact
    #[instrument(level = "debug", skip(self, packet))]
    pub fn consume(&self, addr: SocketAddr, packet: Packet) -> Result<Option<Frame>> {
        self.with_session(addr, |session| session.consume_packet(packet))
    }

    /// Run `f` on the session of `addr`, creating it if needed
    pub fn with_session<T>(
        &self,
        addr: SocketAddr,
        f: impl FnOnce(&mut S) -> Result<T>,
    ) -> Result<T> {
        self.run_in_slot(addr, &self.factory, f)
    }

    /// Like [`SessionHandler::with_session`], creating a missing session with the opener
    pub fn with_opened_session<T>(
        &self,
        addr: SocketAddr,
        f: impl FnOnce(&mut S) -> Result<T>,
    ) -> Result<T> {
        let make = self.opener.as_ref().unwrap_or(&self.factory);
        self.run_in_slot(addr, make, f)
    }

    fn run_in_slot<T>(
        &self,
        addr: SocketAddr,
        make: &SessionFactory<S>,
        f: impl FnOnce(&mut S) -> Result<T>,
    ) -> Result<T> {
        let slot = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string()))?;
            Self::sweep_locked(&mut sessions, self.idle_ttl);
            let slot = sessions
                .entry(addr)
                .or_insert_with(|| {
                    debug!(%addr, "Creating session");
                    Arc::new(SessionSlot {
                        session: Mutex::new(make(addr)),
                        users: AtomicUsize::new(0),
                    })
                })
                .clone();
            slot.users.fetch_add(1, Ordering::AcqRel);
            slot
        };

        let _guard = InUseGuard(&slot.users);
        let mut session = slot
            .session
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SESSION_LOCK.to_string()))?;
        f(&mut *session)
    }

    /// Run `f` on an existing session without creating one
    pub fn session<T>(&self, addr: SocketAddr, f: impl FnOnce(&mut S) -> T) -> Result<Option<T>> {
        let slot = {
            let sessions = self
                .sessions
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string()))?;
            match sessions.get(&addr) {
                Some(slot) => {
                    slot.users.fetch_add(1, Ordering::AcqRel);
                    Arc::clone(slot)
                }
                None => return Ok(None),
            }
        };

        let _guard = InUseGuard(&slot.users);
        let mut session = slot
            .session
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SESSION_LOCK.to_string()))?;
        Ok(Some(f(&mut *session)))
    }

    fn sweep_locked(sessions: &mut HashMap<SocketAddr, Arc<SessionSlot<S>>>, ttl: Duration) -> usize {
        let before = sessions.len();
        sessions.retain(|_, slot| {
            if slot.users.load(Ordering::Acquire) > 0 {
                return true;
            }
            match slot.session.try_lock() {
                Ok(session) => session.last_updated().elapsed() <= ttl,
                Err(TryLockError::WouldBlock) => true,
                Err(TryLockError::Poisoned(_)) => false,
            }
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "Swept idle sessions");
        }
        removed
    }

    /// Forget idle sessions now; returns how many were removed
    pub fn sweep(&self) -> Result<usize> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string()))?;
        Ok(Self::sweep_locked(&mut sessions, self.idle_ttl))
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(&addr))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

impl SessionHandler<ServerSession> {
    /// Server registry whose sessions share one reply handler, settings and registry
    pub fn for_server(
        settings: ServerSettings,
        handler: Arc<dyn CommandHandler>,
        registry: Arc<MessageRegistry>,
        idle_ttl: Duration,
    ) -> Self {
        let settings = Arc::new(settings);
        let factory: SessionFactory<ServerSession> = Arc::new(move |_addr| {
            ServerSession::new(Arc::clone(&settings), Arc::clone(&handler), Arc::clone(&registry))
        });
        Self::new(factory, idle_ttl)
    }
}

impl SessionHandler<ClientSession> {
    pub fn for_client(registry: Arc<MessageRegistry>, settings: ClientSettings) -> Self {
        let ClientSettings {
            reassembly_deadline,
            max_fragment_size,
            session_ttl,
        } = settings;
        let factory: SessionFactory<ClientSession> = Arc::new(move |_addr| {
            ClientSession::new(Arc::clone(&registry), reassembly_deadline, max_fragment_size)
        });
        Self::new(factory, session_ttl)
    }

    /// Start a command towards `addr`
    #[instrument(level = "debug", skip(self, command), fields(kind = command.kind_name()))]
    pub fn send_command(&self, addr: SocketAddr, command: Message) -> Result<Frame> {
        self.with_session(addr, |session| session.send_command(command))
    }
}

impl SessionHandler<Session> {
    /// Endpoints that write first get an answering session; endpoints we query get an
    /// asking one
    pub fn for_peers(
        server: ServerSettings,
        handler: Arc<dyn CommandHandler>,
        registry: Arc<MessageRegistry>,
        client: ClientSettings,
    ) -> Self {
        let server = Arc::new(server);
        let answer_registry = Arc::clone(&registry);
        let answering: SessionFactory<Session> = Arc::new(move |_addr| {
            Session::Server(ServerSession::new(
                Arc::clone(&server),
                Arc::clone(&handler),
                Arc::clone(&answer_registry),
            ))
        });
        let ClientSettings {
            reassembly_deadline,
            max_fragment_size,
            session_ttl,
        } = client;
        let asking: SessionFactory<Session> = Arc::new(move |_addr| {
            Session::Client(ClientSession::new(
                Arc::clone(&registry),
                reassembly_deadline,
                max_fragment_size,
            ))
        });
        Self::new(answering, session_ttl).with_opener(asking)
    }

    /// Start a command towards `addr`
    ///
    /// # Errors
    /// `Custom` when `addr` already holds an answering session, plus the asking role's own
    /// errors.
    #[instrument(level = "debug", skip(self, command), fields(kind = command.kind_name()))]
    pub fn send_command(&self, addr: SocketAddr, command: Message) -> Result<Frame> {
        self.with_opened_session(addr, |session| match session.as_client_mut() {
            Some(client) => client.send_command(command),
            None => Err(ProtocolError::Custom(constants::ERR_PEER_ANSWERING.to_string())),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::codec::Encodable;
    use crate::core::message::{A2sInfo, S2aInfo};

    struct InfoOnly;

    impl CommandHandler for InfoOnly {
        fn info(&self, _request: &A2sInfo) -> Result<Frame> {
            Frame::from_message(Message::S2aInfo(S2aInfo::default()), DEFAULT_FRAGMENT_SIZE)
        }

        fn rules(&self) -> Result<Frame> {
            Err(ProtocolError::UnsupportedMessage(0x56))
        }

        fn players(&self) -> Result<Frame> {
            Err(ProtocolError::UnsupportedMessage(0x55))
        }
    }

    fn server(ttl: Duration) -> ServerSessionHandler {
        ServerSessionHandler::for_server(
            ServerSettings::default(),
            Arc::new(InfoOnly),
            Arc::new(MessageRegistry::new()),
            ttl,
        )
    }

    fn info_packet() -> Packet {
        Packet::short(Message::info_request().to_bytes().unwrap())
    }

    #[test]
    fn test_sessions_per_endpoint() {
        let handler = server(DEFAULT_SESSION_TTL);
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        handler.consume(a, info_packet()).unwrap();
        handler.consume(b, info_packet()).unwrap();
        assert_eq!(handler.len(), 2);

        let challenge_a = handler.session(a, |s| s.challenge()).unwrap().flatten();
        let challenge_b = handler.session(b, |s| s.challenge()).unwrap().flatten();
        assert!(challenge_a.is_some());
        assert!(challenge_b.is_some());
    }

    #[test]
    fn test_error_keeps_session_usable() {
        let handler = server(DEFAULT_SESSION_TTL);
        let addr: SocketAddr = "10.0.0.3:5000".parse().unwrap();
        handler.consume(addr, info_packet()).unwrap();

        let garbage = Packet::short(bytes::Bytes::from_static(&[0x99]));
        assert!(handler.consume(addr, garbage).is_err());
        assert!(handler.contains(addr));
        assert!(handler.consume(addr, info_packet()).is_ok());
    }

    #[test]
    fn test_idle_sessions_swept() {
        let handler = server(Duration::from_millis(1));
        let addr: SocketAddr = "10.0.0.4:5000".parse().unwrap();
        handler.consume(addr, info_packet()).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(handler.sweep().unwrap(), 1);
        assert!(handler.is_empty());
        assert_eq!(handler.session(addr, |_| ()).unwrap(), None);
    }

    fn peers() -> PeerSessionHandler {
        PeerSessionHandler::for_peers(
            ServerSettings::default(),
            Arc::new(InfoOnly),
            Arc::new(MessageRegistry::new()),
            ClientSettings::default(),
        )
    }

    fn only_packet(frame: &Frame) -> Packet {
        assert_eq!(frame.total(), 1);
        frame.packets().next().unwrap().clone()
    }

    #[test]
    fn test_peers_ask_and_answer() {
        let (a, b) = (peers(), peers());
        let a_addr: SocketAddr = "10.0.1.1:27015".parse().unwrap();
        let b_addr: SocketAddr = "10.0.1.2:27015".parse().unwrap();

        let request = a.send_command(b_addr, Message::info_request()).unwrap();
        let challenge = b.consume(a_addr, only_packet(&request)).unwrap().unwrap();
        let resend = a.consume(b_addr, only_packet(&challenge)).unwrap().unwrap();
        let reply = b.consume(a_addr, only_packet(&resend)).unwrap().unwrap();
        assert!(a.consume(b_addr, only_packet(&reply)).unwrap().is_none());

        let response = a
            .session(b_addr, |s| s.as_client_mut().and_then(|c| c.take_response()))
            .unwrap()
            .flatten();
        assert!(matches!(response, Some(Message::S2aInfo(_))));
        assert!(b.session(a_addr, |s| s.as_server().is_some()).unwrap().unwrap());
    }

    #[test]
    fn test_peer_answering_endpoint_cannot_be_asked() {
        let handler = peers();
        let addr: SocketAddr = "10.0.1.3:27015".parse().unwrap();
        handler.consume(addr, info_packet()).unwrap();

        match handler.send_command(addr, Message::rules_request()) {
            Err(ProtocolError::Custom(msg)) => assert_eq!(msg, constants::ERR_PEER_ANSWERING),
            other => panic!("unexpected {other:?}"),
        }
        let other: SocketAddr = "10.0.1.4:27015".parse().unwrap();
        handler.send_command(other, Message::rules_request()).unwrap();
        assert!(handler.session(other, |s| s.as_client().is_some()).unwrap().unwrap());
    }

    #[test]
    fn test_in_use_session_not_swept() {
        let handler = server(Duration::ZERO);
        let addr: SocketAddr = "10.0.0.5:5000".parse().unwrap();
        handler.consume(addr, info_packet()).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let removed = handler
            .session(addr, |_| handler.sweep().unwrap())
            .unwrap();
        assert_eq!(removed, Some(0));
        assert!(handler.contains(addr));
    }
}
