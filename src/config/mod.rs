//! Configuration for the gossip node
//!
//! Values only: where they come from (files, CLI, environment) is up to the
//! embedding application. JSON and TOML file helpers are provided for convenience.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::network::handshake::{Fingerprint, ProtocolFeatures, ValidHandshake, FINGERPRINT_LENGTH};

fn default_bind_address() -> String {
    "0.0.0.0:15600".to_string()
}

fn default_max_peers() -> usize {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_send_queue_size() -> usize {
    1000
}

fn default_event_queue_size() -> usize {
    10_000
}

fn default_broadcast_queue_size() -> usize {
    1000
}

fn default_work_queue_size() -> usize {
    10_000
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_synced_count_cooldown_ms() -> u64 {
    1000
}

fn default_mwm() -> u8 {
    14
}

fn default_coordinator_address() -> String {
    hex::encode([0u8; FINGERPRINT_LENGTH])
}

fn default_protocol_features() -> u64 {
    ProtocolFeatures::default().bits()
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "gossip_node::network=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the json-logging feature)
    #[serde(default)]
    pub json_format: bool,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// `host:port` of the peer
    pub address: String,

    /// Display name used in logs
    #[serde(default)]
    pub alias: Option<String>,

    /// Prefer IPv6 addresses when the host resolves to both families
    #[serde(default)]
    pub prefer_ipv6: bool,
}

/// Work-unit cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnitCacheConfig {
    /// Lifetime of a cached work unit in milliseconds
    #[serde(default = "default_work_unit_ttl_ms")]
    pub ttl_ms: u64,

    /// Maximum number of cached work units
    #[serde(default = "default_work_unit_capacity")]
    pub capacity: usize,
}

fn default_work_unit_ttl_ms() -> u64 {
    5_000
}

fn default_work_unit_capacity() -> usize {
    50_000
}

impl Default for WorkUnitCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_work_unit_ttl_ms(),
            capacity: default_work_unit_capacity(),
        }
    }
}

/// Request queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Pending requests older than this are dropped on re-enqueue (0 = never)
    #[serde(default = "default_discard_older_than_secs")]
    pub discard_older_than_secs: u64,

    /// How often pending requests are swept back into the queue
    #[serde(default = "default_pending_sweep_interval_secs")]
    pub pending_sweep_interval_secs: u64,

    /// Idle wait of the request dispatcher when the queue is empty
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Number of latency samples in the rolling average
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
}

fn default_discard_older_than_secs() -> u64 {
    30
}

fn default_pending_sweep_interval_secs() -> u64 {
    1
}

fn default_dispatch_interval_ms() -> u64 {
    100
}

fn default_latency_window() -> usize {
    100
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            discard_older_than_secs: default_discard_older_than_secs(),
            pending_sweep_interval_secs: default_pending_sweep_interval_secs(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            latency_window: default_latency_window(),
        }
    }
}

/// Gossip node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Listening address for inbound peers
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum number of static (non-autopeered) connected peers
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Accept handshakes from peers that are not whitelisted
    #[serde(default)]
    pub accept_any_peer: bool,

    /// Statically configured peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Capacity of each peer's outbound queue
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,

    /// Capacity of the inbound network event queue
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    #[serde(default = "default_broadcast_queue_size")]
    pub broadcast_queue_size: usize,

    /// Capacity of the processor's work queue
    #[serde(default = "default_work_queue_size")]
    pub work_queue_size: usize,

    /// Number of processor workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub work_unit_cache: WorkUnitCacheConfig,

    #[serde(default)]
    pub requests: RequestConfig,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Cache lifetime of the connected-and-synced peer count
    #[serde(default = "default_synced_count_cooldown_ms")]
    pub synced_count_cooldown_ms: u64,

    /// Minimum weight magnitude both sides must agree on
    #[serde(default = "default_mwm")]
    pub mwm: u8,

    /// Hex encoded network fingerprint (coordinator address, 49 bytes)
    #[serde(default = "default_coordinator_address")]
    pub coordinator_address: String,

    /// Supported protocol version bitmask
    #[serde(default = "default_protocol_features")]
    pub protocol_features: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_peers: default_max_peers(),
            accept_any_peer: false,
            peers: Vec::new(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            send_queue_size: default_send_queue_size(),
            event_queue_size: default_event_queue_size(),
            broadcast_queue_size: default_broadcast_queue_size(),
            work_queue_size: default_work_queue_size(),
            workers: default_workers(),
            work_unit_cache: WorkUnitCacheConfig::default(),
            requests: RequestConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            synced_count_cooldown_ms: default_synced_count_cooldown_ms(),
            mwm: default_mwm(),
            coordinator_address: default_coordinator_address(),
            protocol_features: default_protocol_features(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GossipConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse TOML config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_socket_addr()?;
        self.fingerprint()?;

        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        for (name, size) in [
            ("send_queue_size", self.send_queue_size),
            ("event_queue_size", self.event_queue_size),
            ("broadcast_queue_size", self.broadcast_queue_size),
            ("work_queue_size", self.work_queue_size),
        ] {
            if size == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }
        if ProtocolFeatures::from_bits_retain(self.protocol_features).is_empty() {
            anyhow::bail!("protocol_features must announce at least one version");
        }
        Ok(())
    }

    pub fn bind_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", self.bind_address))
    }

    /// Decode the network fingerprint from `coordinator_address`
    pub fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
        let bytes = hex::decode(&self.coordinator_address)
            .context("coordinator_address is not valid hex")?;
        let fingerprint: Fingerprint = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "coordinator_address must be {} bytes, got {}",
                FINGERPRINT_LENGTH,
                bytes.len()
            )
        })?;
        Ok(fingerprint)
    }

    /// Handshake parameters remote peers must match
    pub fn valid_handshake(&self) -> anyhow::Result<ValidHandshake> {
        Ok(ValidHandshake {
            server_port: self.bind_socket_addr()?.port(),
            fingerprint: self.fingerprint()?,
            mwm: self.mwm,
            features: ProtocolFeatures::from_bits_retain(self.protocol_features),
        })
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn synced_count_cooldown(&self) -> Duration {
        Duration::from_millis(self.synced_count_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GossipConfig::default();
        config.validate().unwrap();
        let handshake = config.valid_handshake().unwrap();
        assert_eq!(handshake.server_port, 15600);
        assert_eq!(handshake.features, ProtocolFeatures::STING);
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let config = GossipConfig {
            bind_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_length_checked() {
        let config = GossipConfig {
            coordinator_address: hex::encode([1u8; 32]),
            ..Default::default()
        };
        assert!(config.fingerprint().is_err());
    }

    #[test]
    fn test_toml_partial_config_uses_defaults() {
        let config: GossipConfig = toml::from_str(
            r#"
            bind_address = "127.0.0.1:14600"
            max_peers = 8

            [[peers]]
            address = "example.org:15600"
            alias = "example"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.peers.len(), 1);
        assert!(!config.peers[0].prefer_ipv6);
        assert_eq!(config.mwm, 14);
        assert_eq!(config.requests.latency_window, 100);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gossip.json");
        let config = GossipConfig {
            accept_any_peer: true,
            ..Default::default()
        };
        config.to_json_file(&path).unwrap();
        let loaded = GossipConfig::from_json_file(&path).unwrap();
        assert!(loaded.accept_any_peer);
        assert_eq!(loaded.bind_address, config.bind_address);
    }
}
