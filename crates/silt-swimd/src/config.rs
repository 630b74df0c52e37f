//! Daemon configuration file.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use silt_swim::GcMode;

/// Complete daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwimdConfig {
    /// Listen URI, `a.b.c.d:port`. Port 0 picks an ephemeral port.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Fixed node UUID. A random v4 UUID is generated when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Protocol period in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Ack timeout in milliseconds. Defaults to a third of the
    /// heartbeat.
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    /// Whether dead members are garbage collected.
    #[serde(default = "default_gc")]
    pub gc: GcMode,
    /// Members to add at startup.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One seed peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer URI, `a.b.c.d:port`.
    pub uri: String,
    /// Peer UUID.
    pub uuid: Uuid,
}

impl Default for SwimdConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            uuid: None,
            heartbeat_ms: default_heartbeat_ms(),
            ack_timeout_ms: None,
            gc: default_gc(),
            peers: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl SwimdConfig {
    /// Load the configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }
}

// Default value functions

fn default_listen() -> String {
    "127.0.0.1:3391".to_string()
}

fn default_heartbeat_ms() -> u64 {
    silt_swim::DEFAULT_HEARTBEAT_MS
}

fn default_gc() -> GcMode {
    GcMode::On
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: SwimdConfig = toml::from_str("").expect("empty config");
        assert_eq!(config.listen, "127.0.0.1:3391");
        assert_eq!(config.heartbeat_ms, 1000);
        assert!(config.uuid.is_none());
        assert!(config.peers.is_empty());
        assert_eq!(config.gc, GcMode::On);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            listen = "127.0.0.1:4000"
            uuid = "00000000-0000-0000-0000-000000000001"
            heartbeat_ms = 250
            ack_timeout_ms = 50
            gc = "off"
            log_level = "debug"

            [[peers]]
            uri = "127.0.0.1:4001"
            uuid = "00000000-0000-0000-0000-000000000002"
        "#;
        let config: SwimdConfig = toml::from_str(text).expect("config");
        assert_eq!(config.listen, "127.0.0.1:4000");
        assert_eq!(config.uuid, Some(Uuid::from_u128(1)));
        assert_eq!(config.heartbeat_ms, 250);
        assert_eq!(config.ack_timeout_ms, Some(50));
        assert_eq!(config.gc, GcMode::Off);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].uuid, Uuid::from_u128(2));
    }
}
