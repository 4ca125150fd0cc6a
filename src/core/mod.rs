//! # Core Protocol Components
//!
//! Wire-level types of the source engine query protocol.
//!
//! This module provides the foundation of the stack: datagram headers, logical
//! messages, the extensible player field codec and the registries that dispatch
//! raw bytes to a type by content.
//!
//! ## Components
//! - **Wire**: little-endian reader and null-terminated string helpers
//! - **Codec**: capability traits and the `UdpFramed` datagram codec
//! - **Packet**: short (`-1`) and long (`-2`, fragment) datagram headers
//! - **Message**: tagged enum of request and reply kinds
//! - **Field**: self-describing player attributes for the player-ex extension
//! - **Registry**: injected message and field registries
//!
//! ## Wire Format
//! ```text
//! Short: [FF FF FF FF] [Message(N)]
//! Long:  [FE FF FF FF] [Id(4)] [Total(1)] [Number(1)] [Size(2)] [Fragment(N)]
//! ```
//!
//! ## Safety
//! Decoders never read past the end of a buffer: truncation surfaces as
//! `WrongHeader` once a header byte has been accepted.

pub mod codec;
pub mod field;
pub mod message;
pub mod packet;
pub mod registry;
pub mod wire;
