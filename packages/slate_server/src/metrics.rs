//! Server metrics for observability
//!
//! Counters for the hot broadcast path. Everything here is fire-and-forget;
//! the snapshot is exposed on `/metrics` as JSON.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug)]
pub struct ServerMetrics {
    /// Currently active WebSocket sessions
    pub active_connections: AtomicU64,
    /// Total sessions since server start
    pub total_connections: AtomicU64,
    /// Connections closed with the unauthorized close code
    pub auth_rejections: AtomicU64,

    /// Envelopes received from clients
    pub messages_received: AtomicU64,
    /// Envelopes admitted and fanned out
    pub messages_forwarded: AtomicU64,
    /// Envelopes rejected by role policy (ERROR sent back)
    pub messages_rejected: AtomicU64,
    /// High-frequency envelopes discarded for staleness
    pub messages_discarded_stale: AtomicU64,
    /// Undecodable or server-only envelopes dropped
    pub messages_malformed: AtomicU64,
    /// Deliveries dropped because a subscriber channel was full
    pub deliveries_dropped: AtomicU64,

    /// Backplane publishes that failed (logged and swallowed)
    pub backplane_publish_failures: AtomicU64,
    /// Envelopes received from other server processes via the backplane
    pub backplane_messages_received: AtomicU64,

    start_time: Instant,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_discarded_stale: AtomicU64::new(0),
            messages_malformed: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            backplane_publish_failures: AtomicU64::new(0),
            backplane_messages_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn auth_rejection(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_discarded_stale(&self) {
        self.messages_discarded_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_malformed(&self) {
        self.messages_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backplane_publish_failure(&self) {
        self.backplane_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backplane_message_received(&self) {
        self.backplane_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                forwarded: self.messages_forwarded.load(Ordering::Relaxed),
                rejected: self.messages_rejected.load(Ordering::Relaxed),
                discarded_stale: self.messages_discarded_stale.load(Ordering::Relaxed),
                malformed: self.messages_malformed.load(Ordering::Relaxed),
                deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            },
            backplane: BackplaneMetrics {
                publish_failures: self.backplane_publish_failures.load(Ordering::Relaxed),
                messages_received: self.backplane_messages_received.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub backplane: BackplaneMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub auth_rejections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub discarded_stale: u64,
    pub malformed: u64,
    pub deliveries_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneMetrics {
    pub publish_failures: u64,
    pub messages_received: u64,
}
