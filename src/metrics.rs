//! Process-wide connection metrics.
//!
//! Per-connection counters live in [`ArqStats`]; this module aggregates
//! them across all connections a process has carried. Connection totals are
//! folded in when a connection closes, so the snapshot lags live traffic by
//! at most one connection lifetime.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tether_core::ArqStats;

/// Global metrics collector
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    /// Connections ever opened
    pub connections_opened: AtomicU64,
    /// Connections currently live
    pub active_connections: AtomicUsize,
    /// Handshakes turned away at capacity
    pub connections_refused: AtomicU64,
    /// Payload totals across closed connections
    pub total_bytes_sent: AtomicU64,
    pub total_bytes_received: AtomicU64,
    pub total_segments_sent: AtomicU64,
    pub total_segments_received: AtomicU64,
    pub total_retransmits: AtomicU64,
}

impl GlobalMetrics {
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a closing connection's totals into the aggregate.
    pub fn connection_closed(&self, stats: &ArqStats) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add(stats.bytes_sent, Ordering::Relaxed);
        self.total_bytes_received
            .fetch_add(stats.bytes_received, Ordering::Relaxed);
        self.total_segments_sent
            .fetch_add(stats.segments_sent, Ordering::Relaxed);
        self.total_segments_received
            .fetch_add(stats.segments_received, Ordering::Relaxed);
        self.total_retransmits
            .fetch_add(stats.retransmits + stats.fast_retransmits, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_segments_sent: self.total_segments_sent.load(Ordering::Relaxed),
            total_segments_received: self.total_segments_received.load(Ordering::Relaxed),
            total_retransmits: self.total_retransmits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the aggregate counters
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub active_connections: usize,
    pub connections_refused: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_segments_sent: u64,
    pub total_segments_received: u64,
    pub total_retransmits: u64,
}

impl MetricsSnapshot {
    /// Fraction of sent segments that were retransmissions.
    pub fn retransmit_rate(&self) -> f64 {
        if self.total_segments_sent == 0 {
            0.0
        } else {
            self.total_retransmits as f64 / self.total_segments_sent as f64
        }
    }

    /// Combined throughput over `duration` in bytes per second.
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let total = self.total_bytes_sent + self.total_bytes_received;
        total as f64 / duration.as_secs_f64()
    }
}

static METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

/// The process-wide metrics instance.
pub fn global_metrics() -> &'static GlobalMetrics {
    &METRICS
}

/// Human-readable dump for logs and diagnostics.
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Transport metrics:\n\
         Connections: {} opened, {} active, {} refused\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Segments: {} sent, {} received\n\
         Retransmits: {} (rate: {:.2}%)",
        snapshot.connections_opened,
        snapshot.active_connections,
        snapshot.connections_refused,
        snapshot.total_bytes_sent,
        snapshot.total_bytes_received,
        snapshot.total_segments_sent,
        snapshot.total_segments_received,
        snapshot.total_retransmits,
        snapshot.retransmit_rate() * 100.0,
    )
}
