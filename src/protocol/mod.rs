//! # Protocol Layer
//!
//! Everything between a decoded [`Packet`](crate::core::packet::Packet) and a reply.
//!
//! ## Components
//! - **Frame**: splits a message into datagrams and reassembles fragments
//! - **Session**: per-endpoint reassembly and the `SessionState` seam
//! - **Server**: challenge issuing and command dispatch for the answering role
//! - **Client**: command / challenge / reply pairing for the asking role
//! - **Handler**: registry of sessions keyed by remote address, with idle sweeping; the peer
//!   registry stores the role-tagged `Session`
//! - **Stats**: default reply builder over a shared game stats snapshot
//!
//! ## Exchange
//! ```text
//! client                         server
//!   A2S_RULES (no challenge)  ->
//!                             <- S2C_CHALLENGE c
//!   A2S_RULES c               ->
//!                             <- S2A_RULES (1..255 fragments)
//! ```

pub mod client;
pub mod frame;
pub mod handler;
pub mod server;
pub mod session;
pub mod stats;
