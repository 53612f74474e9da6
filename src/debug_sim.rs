//! Debug packet-loss and latency simulation.
//!
//! Approximate by nature: the delayed-delivery list is a small `Vec` scanned once per logic
//! tick, not a min-heap, since in practice it stays tiny.

use std::net::SocketAddr;
use std::sync::Mutex;

use crate::config::Config;
use crate::time::{LocalDuration, LocalTime};

const LATENCY_FLOOR_MS: u64 = 5;

struct Delayed {
    bytes: Vec<u8>,
    endpoint: SocketAddr,
    release_at: LocalTime,
}

/// Holds datagrams that passed loss simulation but are being held back to simulate latency.
#[derive(Default)]
pub struct DebugDelayQueue {
    pending: Mutex<Vec<Delayed>>,
}

impl DebugDelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `bytes` should be dropped outright per `config.simulate_packet_loss`.
    pub fn should_drop(config: &Config) -> bool {
        config.simulate_packet_loss
            && fastrand::u8(0..100) < config.simulation_packet_loss_chance
    }

    /// Draw a latency delay per `config.simulate_latency`. Returns `None` if the draw is below
    /// the floor and the datagram should be delivered immediately.
    fn draw_latency(config: &Config) -> Option<LocalDuration> {
        if !config.simulate_latency || config.simulation_max_latency_ms <= config.simulation_min_latency_ms {
            return None;
        }
        let millis = fastrand::u64(config.simulation_min_latency_ms..config.simulation_max_latency_ms);
        if millis <= LATENCY_FLOOR_MS {
            None
        } else {
            Some(LocalDuration::from_millis(millis as u128))
        }
    }

    /// Attempt to delay `bytes`. Returns `true` if the datagram was queued (caller should not
    /// process it now); `false` if it should be delivered immediately.
    pub fn try_delay(&self, config: &Config, bytes: &[u8], endpoint: SocketAddr, now: LocalTime) -> bool {
        match Self::draw_latency(config) {
            Some(delay) => {
                let mut pending = self.pending.lock().expect("debug delay queue poisoned");
                pending.push(Delayed {
                    bytes: bytes.to_vec(),
                    endpoint,
                    release_at: now + delay,
                });
                true
            }
            None => false,
        }
    }

    /// Drain every entry whose delay has elapsed, for redelivery into the receive path.
    pub fn drain_matured(&self, now: LocalTime) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut pending = self.pending.lock().expect("debug delay queue poisoned");
        let (matured, remaining): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|d| now >= d.release_at);
        *pending = remaining;
        matured.into_iter().map(|d| (d.bytes, d.endpoint)).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("debug delay queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_delivery_when_latency_disabled() {
        let queue = DebugDelayQueue::new();
        let config = Config::default();
        let delayed = queue.try_delay(&config, b"hi", "127.0.0.1:9000".parse().unwrap(), LocalTime::now());
        assert!(!delayed);
    }

    #[test]
    fn matured_entries_drain_after_release_time() {
        let queue = DebugDelayQueue::new();
        let mut config = Config::default();
        config.simulate_latency = true;
        config.simulation_min_latency_ms = 10;
        config.simulation_max_latency_ms = 11;

        let now = LocalTime::from_millis(1_000_000);
        let delayed = queue.try_delay(&config, b"hi", "127.0.0.1:9000".parse().unwrap(), now);
        assert!(delayed);
        assert_eq!(queue.pending_count(), 1);

        assert!(queue.drain_matured(now).is_empty());
        let later = now + LocalDuration::from_millis(50);
        let matured = queue.drain_matured(later);
        assert_eq!(matured.len(), 1);
        assert_eq!(queue.pending_count(), 0);
    }
}
