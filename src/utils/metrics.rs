//! Observability and Metrics
//!
//! Atomic counters for query traffic, shared by the transport and its session handler.
//! Each server owns its own [`Metrics`] behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for query protocol traffic
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams received
    pub datagrams_received: AtomicU64,
    /// Datagrams sent
    pub datagrams_sent: AtomicU64,
    /// Bytes received
    pub bytes_received: AtomicU64,
    /// Bytes sent
    pub bytes_sent: AtomicU64,
    /// Messages rebuilt from more than one fragment
    pub frames_reassembled: AtomicU64,
    /// S2C_CHALLENGE replies produced
    pub challenges_issued: AtomicU64,
    /// Replies produced by a server
    pub replies_sent: AtomicU64,
    /// Paired replies accepted by a client
    pub replies_received: AtomicU64,
    /// Datagrams that failed to decode
    pub decode_errors: AtomicU64,
    /// Messages rejected by a session
    pub session_errors: AtomicU64,
    /// Socket level failures
    pub io_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_reassembled: AtomicU64::new(0),
            challenges_issued: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            session_errors: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_reassembled(&self) {
        self.frames_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn challenge_issued(&self) {
        self.challenges_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_error(&self) {
        self.session_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_reassembled: self.frames_reassembled.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            datagrams_received = snapshot.datagrams_received,
            datagrams_sent = snapshot.datagrams_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            frames_reassembled = snapshot.frames_reassembled,
            challenges_issued = snapshot.challenges_issued,
            replies_sent = snapshot.replies_sent,
            replies_received = snapshot.replies_received,
            decode_errors = snapshot.decode_errors,
            session_errors = snapshot.session_errors,
            io_errors = snapshot.io_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Query metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_reassembled: u64,
    pub challenges_issued: u64,
    pub replies_sent: u64,
    pub replies_received: u64,
    pub decode_errors: u64,
    pub session_errors: u64,
    pub io_errors: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Every rejected datagram, whatever the stage
    pub fn total_errors(&self) -> u64 {
        self.decode_errors + self.session_errors + self.io_errors
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        metrics.datagram_received(25);
        metrics.datagram_received(5);
        metrics.datagram_sent(9);
        metrics.challenge_issued();
        metrics.reply_received();
        metrics.decode_error();
        metrics.session_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.datagrams_received, 2);
        assert_eq!(snapshot.bytes_received, 30);
        assert_eq!(snapshot.bytes_sent, 9);
        assert_eq!(snapshot.challenges_issued, 1);
        assert_eq!(snapshot.replies_received, 1);
        assert_eq!(snapshot.replies_sent, 0);
        assert_eq!(snapshot.total_errors(), 2);
    }
}
