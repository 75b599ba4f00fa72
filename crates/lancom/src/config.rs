//! Ports, intervals and timeouts shared by master and peer nodes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tag placed at the start of every discovery beacon.
pub const BEACON_TAG: &str = "LancomMaster";

/// Protocol version announced in the beacon.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port the master broadcasts its beacon on.
pub const DISCOVERY_PORT: u16 = 7720;

/// Default port of the master's request/reply endpoint.
pub const MASTER_SERVICE_PORT: u16 = 7721;

/// Default port the master publishes its id on.
pub const MASTER_TOPIC_PORT: u16 = 7722;

/// Configuration of a LanCom node.
///
/// Master and peers must agree on the three well-known ports; everything
/// else is local tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanComConfig {
    /// UDP port used for the master beacon.
    pub discovery_port: u16,

    /// Port of the master's request/reply endpoint.
    pub master_service_port: u16,

    /// Port of the master's liveness publisher.
    pub master_topic_port: u16,

    /// Pause between two beacons (and two liveness publications).
    #[serde(with = "duration_ms")]
    pub broadcast_interval: Duration,

    /// How long a peer listens for a beacon before giving up.
    #[serde(with = "duration_ms")]
    pub discovery_timeout: Duration,

    /// Upper bound for one outgoing request/reply exchange.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Pause between two liveness sweeps of the master.
    #[serde(with = "duration_ms")]
    pub liveness_interval: Duration,

    /// Consecutive failed pings before the master evicts a node.
    /// `0` disables eviction.
    pub max_missed_pings: u32,
}

impl Default for LanComConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            master_service_port: MASTER_SERVICE_PORT,
            master_topic_port: MASTER_TOPIC_PORT,
            broadcast_interval: Duration::from_millis(100),
            discovery_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(1),
            max_missed_pings: 3,
        }
    }
}

impl LanComConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<LanComConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }

    /// Whether the master should evict nodes that stop answering pings.
    pub fn eviction_enabled(&self) -> bool {
        self.max_missed_pings > 0
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
