//! Server metrics for observability
//!
//! Counters for relay traffic and uploads, exposed on `/metrics` and
//! summarised on `/health`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open relay sockets (plugin and application)
    pub active_connections: AtomicU64,
    /// Total relay sockets since server start
    pub total_connections: AtomicU64,
    /// Sockets closed because the same user reconnected on the same side
    pub connections_replaced: AtomicU64,

    // Relay metrics
    /// Frames forwarded to the counterpart
    pub frames_relayed: AtomicU64,
    /// Application heartbeats swallowed by the relay
    pub heartbeats_dropped: AtomicU64,
    /// Frames answered with a Disconnected presence because no counterpart was attached
    pub frames_unrouted: AtomicU64,

    // Upload metrics
    pub uploads_completed: AtomicU64,
    pub uploads_failed: AtomicU64,
    /// Uploads refused by the quota or body cap
    pub uploads_rejected: AtomicU64,
    /// Bytes written to project storage
    pub bytes_stored: AtomicU64,

    // Error metrics
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_replaced(&self) {
        self.connections_replaced.fetch_add(1, Ordering::Relaxed);
    }

    // Relay tracking
    pub fn frame_relayed(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_dropped(&self) {
        self.heartbeats_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_unrouted(&self) {
        self.frames_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Upload tracking
    pub fn upload_completed(&self, bytes: u64) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_rejected(&self) {
        self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                replaced: self.connections_replaced.load(Ordering::Relaxed),
            },
            relay: RelayMetrics {
                relayed: self.frames_relayed.load(Ordering::Relaxed),
                heartbeats_dropped: self.heartbeats_dropped.load(Ordering::Relaxed),
                unrouted: self.frames_unrouted.load(Ordering::Relaxed),
            },
            uploads: UploadMetrics {
                completed: self.uploads_completed.load(Ordering::Relaxed),
                failed: self.uploads_failed.load(Ordering::Relaxed),
                rejected: self.uploads_rejected.load(Ordering::Relaxed),
                bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub relay: RelayMetrics,
    pub uploads: UploadMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub replaced: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub relayed: u64,
    pub heartbeats_dropped: u64,
    pub unrouted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetrics {
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub bytes_stored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub users: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
