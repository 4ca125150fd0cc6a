//! # Source Query Protocol
//!
//! UDP server-status query protocol compatible with the source engine query family
//! (`A2S_INFO`, `A2S_PLAYER`, `A2S_RULES`), including challenge handshakes, multi-datagram
//! fragmentation and a self-describing player-ex extension.
//!
//! ## Layers
//! - [`core`]: packets, messages, player fields and the registries that decode them
//! - [`protocol`]: frames, per-endpoint sessions for both roles and their registries
//! - [`transport`]: Tokio UDP server and client, reply cache
//! - [`utils`]: logging setup, metrics, time helpers
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::sync::{Arc, RwLock};
//! use source_query_protocol::config::QueryConfig;
//! use source_query_protocol::protocol::stats::{GameStats, StatsReplyBuilder};
//! use source_query_protocol::transport::udp::QueryServer;
//!
//! # async fn run() -> source_query_protocol::error::Result<()> {
//! let config = QueryConfig::default();
//! let stats = Arc::new(RwLock::new(GameStats::default()));
//! let builder = Arc::new(StatsReplyBuilder::new(stats));
//! let server = QueryServer::bind(&config, builder).await?;
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::message::Message;
pub use crate::core::packet::Packet;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::frame::Frame;
