//! Server configuration.

use std::time::Duration;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use beacon_hub::HubConfig;

/// Configuration for the beacon server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8081`, `0` for auto-assign).
    pub port: u16,
    /// Per-session outbound queue capacity.
    pub outbound_capacity: usize,
    /// Seconds between server-initiated Ping frames.
    pub ping_interval_secs: u64,
    /// Seconds of inbound silence before a connection is reclaimed.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            outbound_capacity: 256,
            ping_interval_secs: 54,
            idle_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `BEACON_*` environment variables
    /// (`BEACON_PORT`, `BEACON_HOST`, ...).
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("BEACON_"))
            .extract()
    }

    /// The subset the hub and its session pumps need.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.outbound_capacity,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}
