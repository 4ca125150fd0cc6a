//! # Transport Layer
//!
//! Tokio UDP front ends and the reply cache they serve from.
//!
//! ## Components
//! - **UDP**: `QueryServer`, `QueryClient` and the socket-free `QueryService`
//! - **Reply cache**: per-kind TTL cache of built reply frames

pub mod reply_cache;
pub mod udp;
