//! Engine tunables.

use std::time::Duration;

use serde::Deserialize;

/// HTTP engine configuration.
///
/// All fields have defaults, so an embedding servent can deserialize this
/// from a partial table in its own configuration tree.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// Deadline for requests still connecting, in milliseconds.
    /// Default: 30000 (30 seconds)
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Deadline for requests past the connect stage, in milliseconds.
    /// Default: 60000 (60 seconds)
    #[serde(default = "default_exchange_ms")]
    pub exchange_ms: u64,
    /// Interval of the timer that expires requests and reclaims finished
    /// ones, in milliseconds.
    /// Default: 1000
    #[serde(default = "default_sweep_ms")]
    pub sweep_ms: u64,
    /// `User-Agent:` value sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Upper bound on a reply header block, in bytes.
    /// Default: 16384
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            exchange_ms: default_exchange_ms(),
            sweep_ms: default_sweep_ms(),
            user_agent: default_user_agent(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_ms.max(1))
    }
}

fn default_connect_ms() -> u64 {
    30_000
}

fn default_exchange_ms() -> u64 {
    60_000
}

fn default_sweep_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    concat!("muninn/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_header_bytes() -> usize {
    16 * 1024
}
