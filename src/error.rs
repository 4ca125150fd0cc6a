//! # Error Types
//!
//! Error handling for the query protocol stack.
//!
//! Every variant is a request-rejection outcome. Nothing here is fatal to the process:
//! errors are recovered at the session handler / transport boundary, logged, and the
//! offending datagram is dropped.
//!
//! ## Error Categories
//! - **Codec**: `NotIdentified`, `WrongHeader`, `InvalidField`
//! - **Fragmentation**: `AlreadyCompleted`, `WrongPacketType`, `WrongPacketId`,
//!   `DuplicateFragment`, `OversizedMessage`, `FrameExpired`
//! - **Session**: `UnsupportedMessage`, `WrongPacketSequence`, `WrongChallenge`,
//!   `WrongA2SInfoPayload`, `NoPendingCommand`, `WrongServerResponse`,
//!   `PreviousCommandNotCompleted`, `ChallengeShouldNotBeSet`
//! - **Ambient**: `ConfigError`, `Io`, `Timeout`, `Custom`
//!
//! ## Example Usage
//! ```rust
//! use source_query_protocol::core::packet::Packet;
//! use source_query_protocol::error::ProtocolError;
//!
//! match Packet::decode(&[0x00, 0x01]) {
//!     Err(ProtocolError::NotIdentified) => {}
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_SESSION_LOCK: &str = "Failed to acquire session lock";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire session registry lock";
    pub const ERR_STATS_LOCK: &str = "Failed to acquire game stats lock";
    pub const ERR_CACHE_LOCK: &str = "Failed to acquire reply cache lock";
    pub const ERR_DECODER_LOCK: &str = "Failed to acquire decoder registry lock";

    /// Packet structure errors
    pub const ERR_TRUNCATED: &str = "Unexpected end of datagram";
    pub const ERR_FRAGMENT_BOUNDS: &str = "Fragment number must be lower than total (total >= 1)";
    pub const ERR_FRAGMENT_ID: &str = "Fragmentation id must fit in 31 bits";
    pub const ERR_MISSING_TERMINATOR: &str = "String is missing its null terminator";

    /// Session role errors
    pub const ERR_PEER_ANSWERING: &str = "Endpoint is held by an answering session";

    /// Field codec errors
    pub const ERR_FIELD_TYPE: &str = "Wrong field primitive type";
    pub const ERR_FIELD_EXT_ID: &str = "Extended attribute id set but extended flag is not";
    pub const ERR_FIELD_VALUE: &str = "Field value does not match its declared primitive type";
}

/// ProtocolError is the primary error type for all query protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No registered type matches the input")]
    NotIdentified,

    #[error("Wrong header: {0}")]
    WrongHeader(String),

    #[error("Invalid player field: {0}")]
    InvalidField(&'static str),

    #[error("Frame already completed")]
    AlreadyCompleted,

    #[error("Frame can only be built from short or long packets")]
    WrongPacketType,

    #[error("Wrong packet id: expected {expected}, got {actual}")]
    WrongPacketId { expected: u32, actual: u32 },

    #[error("Duplicate fragment number: {0}")]
    DuplicateFragment(u8),

    #[error("Message too large to fragment: {0} bytes")]
    OversizedMessage(usize),

    #[error("Fragment reassembly deadline exceeded")]
    FrameExpired,

    #[error("Unsupported message: header 0x{0:02X}")]
    UnsupportedMessage(u8),

    #[error("Non-fragment packet received during reassembly")]
    WrongPacketSequence,

    #[error("Wrong challenge")]
    WrongChallenge,

    #[error("Wrong A2S_INFO payload: {0:?}")]
    WrongA2SInfoPayload(String),

    #[error("No pending command")]
    NoPendingCommand,

    #[error("Wrong server response: 0x{response:02X} for request 0x{request:02X}")]
    WrongServerResponse { request: u8, response: u8 },

    #[error("Previous command not completed")]
    PreviousCommandNotCompleted,

    #[error("Challenge should not be set by the caller")]
    ChallengeShouldNotBeSet,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Shorthand used by decoders once a discriminant has been accepted
    pub(crate) fn wrong_header(reason: &str) -> Self {
        ProtocolError::WrongHeader(reason.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
