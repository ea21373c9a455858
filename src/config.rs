//! Configuration Module
//!
//! Assembles the node configuration once at startup from environment variables.

use std::env;
use std::time::Duration;

/// Node configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Element budget for the partition (<= 0 means unlimited)
    pub max_elements: i64,
    /// Byte budget for the partition (<= 0 means unlimited)
    pub max_bytes: i64,
    /// Lifetime applied to elements written without an explicit expiration
    pub expiration_interval: Option<Duration>,
    /// Idle timeout applied to newly created elements
    pub idle_interval: Option<Duration>,
    /// Capacity of the in-memory secondary storage, 0 disables spilling
    pub secondary_capacity_bytes: u64,
    /// HTTP server port
    pub server_port: u16,
    /// Background sweep interval in seconds
    pub sweep_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ELEMENTS` - Element budget (default: 10000)
    /// - `MAX_BYTES` - Byte budget (default: 64 MiB)
    /// - `EXPIRATION_SECS` - Default lifetime in seconds, 0 for none (default: 300)
    /// - `IDLE_SECS` - Idle timeout in seconds, 0 for none (default: 0)
    /// - `SECONDARY_CAPACITY_BYTES` - Spill capacity, 0 disables (default: 0)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `SWEEP_INTERVAL` - Sweep frequency in seconds (default: 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_elements: parse_var("MAX_ELEMENTS").unwrap_or(defaults.max_elements),
            max_bytes: parse_var("MAX_BYTES").unwrap_or(defaults.max_bytes),
            expiration_interval: parse_var("EXPIRATION_SECS")
                .map(seconds)
                .unwrap_or(defaults.expiration_interval),
            idle_interval: parse_var("IDLE_SECS")
                .map(seconds)
                .unwrap_or(defaults.idle_interval),
            secondary_capacity_bytes: parse_var("SECONDARY_CAPACITY_BYTES")
                .unwrap_or(defaults.secondary_capacity_bytes),
            server_port: parse_var("SERVER_PORT").unwrap_or(defaults.server_port),
            sweep_interval: parse_var("SWEEP_INTERVAL").unwrap_or(defaults.sweep_interval),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_elements: 10_000,
            max_bytes: 64 * 1024 * 1024,
            expiration_interval: Some(Duration::from_secs(300)),
            idle_interval: None,
            secondary_capacity_bytes: 0,
            server_port: 3000,
            sweep_interval: 1,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

// zero disables the interval
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
