//! Observability and Metrics
//!
//! Atomic counters for connection, framing and upload activity. One
//! [`Metrics`] instance is owned by the server state and shared by reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for protocol engine operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Connections that ended on a transport error
    pub connection_errors: AtomicU64,
    /// Frames decoded from devices
    pub frames_received: AtomicU64,
    /// Frames written to devices
    pub frames_sent: AtomicU64,
    /// Bytes of decoded frames
    pub bytes_received: AtomicU64,
    /// Bytes of written frames
    pub bytes_sent: AtomicU64,
    /// Inbound frames rejected by validation
    pub protocol_errors: AtomicU64,
    /// Chunks kept in the memory tier
    pub chunks_memory: AtomicU64,
    /// Chunks spilled to temp files
    pub chunks_disk: AtomicU64,
    /// Chunks dropped on I/O failure
    pub chunks_failed: AtomicU64,
    /// Uploads merged into an artifact
    pub uploads_completed: AtomicU64,
    /// Uploads whose merge failed
    pub uploads_failed: AtomicU64,
    /// Upload contexts discarded without an upload-end
    pub uploads_abandoned: AtomicU64,
    /// Sessions evicted by the sweeper
    pub sessions_expired: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            chunks_memory: AtomicU64::new(0),
            chunks_disk: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            uploads_completed: AtomicU64::new(0),
            uploads_failed: AtomicU64::new(0),
            uploads_abandoned: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_in_memory(&self) {
        self.chunks_memory.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_on_disk(&self) {
        self.chunks_disk.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_completed(&self) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload_abandoned(&self) {
        self.uploads_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_expired(&self) {
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            chunks_memory: self.chunks_memory.load(Ordering::Relaxed),
            chunks_disk: self.chunks_disk.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            uploads_abandoned: self.uploads_abandoned.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connection_errors = snapshot.connection_errors,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            protocol_errors = snapshot.protocol_errors,
            chunks_memory = snapshot.chunks_memory,
            chunks_disk = snapshot.chunks_disk,
            chunks_failed = snapshot.chunks_failed,
            uploads_completed = snapshot.uploads_completed,
            uploads_failed = snapshot.uploads_failed,
            uploads_abandoned = snapshot.uploads_abandoned,
            sessions_expired = snapshot.sessions_expired,
            uptime_seconds = snapshot.uptime_seconds,
            "Device link metrics snapshot"
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
    pub connections_total: u64,
    pub connections_active: u64,
    pub connection_errors: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub protocol_errors: u64,
    pub chunks_memory: u64,
    pub chunks_disk: u64,
    pub chunks_failed: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub uploads_abandoned: u64,
    pub sessions_expired: u64,
    pub uptime_seconds: u64,
}

/// Logs the elapsed time of an operation when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
