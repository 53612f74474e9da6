//! Read-only transport statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Packet/byte counters maintained by the demultiplexer and logic tick.
///
/// All fields are independent atomics; a snapshot taken via [`NetStatistics::snapshot`] is not a
/// single consistent point-in-time view, the same way `connected_peers_count` is documented as
/// eventually consistent.
#[derive(Debug, Default)]
pub struct NetStatistics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
}

/// A point-in-time copy of [`NetStatistics`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
}

impl NetStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let stats = NetStatistics::new();
        stats.record_received(10);
        stats.record_received(20);
        stats.record_sent(5);
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.bytes_received, 30);
        assert_eq!(snap.packets_sent, 1);
        assert_eq!(snap.packets_dropped, 1);
    }
}
