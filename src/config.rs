//! Runtime configuration.
//!
//! Read once at `NetManager::start` time; mutating a `Config` after the manager has started is
//! not supported.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Tunables for a [`crate::manager::NetManager`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target period of the logic tick, in milliseconds.
    pub update_time_ms: u64,
    /// Interval between keep-alive pings a peer state machine should emit.
    pub ping_interval_ms: u64,
    /// How long a peer may go without a received packet before it is reaped.
    pub disconnect_timeout_ms: u64,
    /// Delay between reconnection attempts.
    pub reconnect_delay_ms: u64,
    /// Maximum number of connection attempts before giving up.
    pub max_connect_attempts: u32,
    /// Whether to set `SO_REUSEADDR` on bind.
    pub reuse_address: bool,
    /// Whether unconnected (out-of-session) messages are delivered to the listener.
    pub unconnected_messages_enabled: bool,
    /// Whether NAT introduction/punch packets are handed to the NAT module.
    pub nat_punch_enabled: bool,
    /// Whether discovery request/response packets are delivered to the listener.
    pub discovery_enabled: bool,
    /// Whether `Merged` packets are accepted.
    pub merge_enabled: bool,
    /// Bypass the event queue and dispatch events synchronously on the producing thread.
    pub unsynced_events: bool,
    /// Automatically recycle a received packet's buffer once its event is dispatched.
    pub auto_recycle: bool,
    /// Enable debug packet-loss simulation.
    pub simulate_packet_loss: bool,
    /// Enable debug latency simulation.
    pub simulate_latency: bool,
    /// Chance (0-100) that an incoming packet is dropped when loss simulation is enabled.
    pub simulation_packet_loss_chance: u8,
    /// Lower bound, in milliseconds, of injected latency.
    pub simulation_min_latency_ms: u64,
    /// Upper bound, in milliseconds, of injected latency.
    pub simulation_max_latency_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_time_ms: 15,
            ping_interval_ms: 1000,
            disconnect_timeout_ms: 5000,
            reconnect_delay_ms: 500,
            max_connect_attempts: 10,
            reuse_address: false,
            unconnected_messages_enabled: false,
            nat_punch_enabled: false,
            discovery_enabled: false,
            merge_enabled: false,
            unsynced_events: false,
            auto_recycle: true,
            simulate_packet_loss: false,
            simulate_latency: false,
            simulation_packet_loss_chance: 10,
            simulation_min_latency_ms: 30,
            simulation_max_latency_ms: 100,
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file, layered over the defaults above.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let source = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;

        source.try_deserialize().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.update_time_ms, 15);
        assert_eq!(cfg.disconnect_timeout_ms, 5000);
        assert_eq!(cfg.max_connect_attempts, 10);
        assert!(cfg.auto_recycle);
        assert!(!cfg.discovery_enabled);
    }

    #[test]
    fn from_file_layers_over_defaults() {
        let dir = std::env::temp_dir().join(format!("net-manager-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "update_time_ms = 30\ndiscovery_enabled = true\n").unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.update_time_ms, 30);
        assert!(cfg.discovery_enabled);
        assert_eq!(cfg.disconnect_timeout_ms, 5000);

        std::fs::remove_dir_all(&dir).ok();
    }
}
