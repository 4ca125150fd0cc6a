//! # Reply Cache
//!
//! Short-lived memoization of built reply frames, keyed by request kind rather than by
//! requester. Every peer asking for the rules within the TTL receives the same frame,
//! fragmentation id included.
//!
//! ## Features
//! - **Thread-safe**: one `Mutex` around a four-entry map
//! - **TTL-based expiration**: entries older than the TTL are rebuilt on next use
//! - **Lock-free builds**: the lock is released while a reply is being built
//!
//! ## Usage
//! ```rust
//! use std::time::Duration;
//! use source_query_protocol::transport::reply_cache::{ReplyCache, ReplyKind};
//! use source_query_protocol::{Frame, Message};
//!
//! let cache = ReplyCache::new(Duration::from_secs(5));
//! let frame = cache
//!     .get_or_build(ReplyKind::Info, || Frame::from_message(Message::challenge_reply(1), 1248))
//!     .unwrap();
//! assert!(cache.get(ReplyKind::Info).is_some());
//! # let _ = frame;
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::frame::Frame;

/// Request kinds whose replies are cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Info,
    Rules,
    Players,
    PlayersEx,
}

/// A cached reply with its build time
#[derive(Debug, Clone)]
struct CacheEntry {
    frame: Frame,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

#[derive(Debug, Default)]
struct ReplyCacheInner {
    entries: HashMap<ReplyKind, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// TTL cache of built reply frames
#[derive(Debug)]
pub struct ReplyCache {
    ttl: Duration,
    inner: Mutex<ReplyCacheInner>,
}

impl ReplyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(ReplyCacheInner::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ReplyCacheInner>> {
        self.inner
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_CACHE_LOCK.to_string()))
    }

    /// Cached frame for `kind`, if still fresh
    pub fn get(&self, kind: ReplyKind) -> Option<Frame> {
        let mut inner = self.lock().ok()?;
        let fresh = inner
            .entries
            .get(&kind)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.frame.clone());

        match fresh {
            Some(frame) => {
                inner.hits += 1;
                trace!(?kind, "Reply cache hit");
                Some(frame)
            }
            None => {
                inner.misses += 1;
                inner.entries.remove(&kind);
                trace!(?kind, "Reply cache miss or expired");
                None
            }
        }
    }

    pub fn store(&self, kind: ReplyKind, frame: Frame) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entries.insert(
            kind,
            CacheEntry {
                frame,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Return the cached frame or build, store and return a new one
    pub fn get_or_build<F>(&self, kind: ReplyKind, build: F) -> Result<Frame>
    where
        F: FnOnce() -> Result<Frame>,
    {
        if let Some(frame) = self.get(kind) {
            return Ok(frame);
        }
        let frame = build()?;
        self.store(kind, frame.clone())?;
        Ok(frame)
    }

    pub fn invalidate(&self, kind: ReplyKind) -> Result<()> {
        self.lock()?.entries.remove(&kind);
        Ok(())
    }

    /// Clear all replies from the cache
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let count = inner.entries.len();
        inner.entries.clear();
        debug!(cleared_count = count, "Reply cache cleared");
        Ok(())
    }

    /// Get current cache statistics
    pub fn stats(&self) -> ReplyCacheStats {
        match self.lock() {
            Ok(inner) => ReplyCacheStats {
                total_entries: inner.entries.len(),
                expired_count: inner
                    .entries
                    .values()
                    .filter(|e| e.is_expired(self.ttl))
                    .count(),
                hits: inner.hits,
                misses: inner.misses,
            },
            Err(_) => ReplyCacheStats::default(),
        }
    }
}

/// Statistics about the reply cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyCacheStats {
    pub total_entries: usize,
    /// Expired but not yet evicted entries
    pub expired_count: usize,
    pub hits: u64,
    pub misses: u64,
}
