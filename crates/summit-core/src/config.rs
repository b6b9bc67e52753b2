//! Configuration for the mesh engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SUMMIT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/summit/config.toml
//!   3. ~/.config/summit/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub mesh: MeshTuning,
    pub store_and_forward: StoreAndForwardConfig,
    pub health: HealthConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the X25519 static keypair. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_peers: usize,
    pub heartbeat_interval_secs: u64,
    pub peer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshTuning {
    pub max_hops: u8,
    pub max_message_size: usize,
    pub fragment_size: usize,
    pub message_ttl_secs: u64,
    pub handshake_timeout_secs: u64,
    pub bloom_size_bits: usize,
    pub bloom_hash_count: u32,
    pub max_pending_fragments: usize,
    pub fragment_timeout_secs: u64,
    pub route_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreAndForwardConfig {
    pub max_cache_bytes: u64,
    pub max_total: usize,
    pub max_per_recipient: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ema_alpha: f64,
    pub ring_buffer_len: usize,
    pub peer_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub min_active_peers: usize,
}

/// Bearer selection policy for the multi-transport. Mirrors
/// [`summit_core`]-external `TransportPolicy` but kept here so config can
/// deserialize it without depending on `summit-services`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicyConfig {
    BleOnly,
    WifiOnly,
    Auto,
    Redundant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub policy: TransportPolicyConfig,
    pub wifi_threshold_bytes: usize,
    pub ble_mtu_default: usize,
    pub ble_mtu_max: usize,
    /// Burst size in messages for each bearer's token bucket.
    pub rate_limit_capacity: f64,
    /// Tokens (messages) added back to each bearer's bucket per second.
    pub rate_limit_refill_per_sec: f64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            mesh: MeshTuning::default(),
            store_and_forward: StoreAndForwardConfig::default(),
            health: HealthConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { key_path: config_dir().join("identity.key") }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_peers: wire::MAX_PEERS,
            heartbeat_interval_secs: wire::HEARTBEAT_INTERVAL_SECS,
            peer_timeout_secs: wire::PEER_TIMEOUT_SECS,
        }
    }
}

impl Default for MeshTuning {
    fn default() -> Self {
        Self {
            max_hops: wire::MAX_HOPS,
            max_message_size: wire::MAX_MESSAGE_SIZE,
            fragment_size: wire::FRAGMENT_SIZE,
            message_ttl_secs: wire::MESSAGE_TTL_SECS,
            handshake_timeout_secs: wire::HANDSHAKE_TIMEOUT_SECS,
            bloom_size_bits: wire::BLOOM_SIZE_BITS,
            bloom_hash_count: wire::BLOOM_HASH_COUNT,
            max_pending_fragments: wire::MAX_PENDING_FRAGMENTS,
            fragment_timeout_secs: wire::FRAGMENT_TIMEOUT_SECS,
            route_timeout_secs: wire::ROUTE_TIMEOUT_SECS,
        }
    }
}

impl Default for StoreAndForwardConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 16 * 1024 * 1024,
            max_total: 2000,
            max_per_recipient: 100,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.2,
            ring_buffer_len: 100,
            peer_timeout_secs: 60,
            sweep_interval_secs: 30,
            min_active_peers: 1,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            policy: TransportPolicyConfig::Auto,
            wifi_threshold_bytes: 4096,
            ble_mtu_default: 23,
            ble_mtu_max: 512,
            rate_limit_capacity: 64.0,
            rate_limit_refill_per_sec: 32.0,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("summit")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SUMMIT_CONFIG").map(PathBuf::from).unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default()).map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply `SUMMIT_*` env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SUMMIT_NETWORK__MAX_PEERS") {
            if let Ok(p) = v.parse() {
                self.network.max_peers = p;
            }
        }
        if let Ok(v) = std::env::var("SUMMIT_NETWORK__PEER_TIMEOUT_SECS") {
            if let Ok(p) = v.parse() {
                self.network.peer_timeout_secs = p;
            }
        }
        if let Ok(v) = std::env::var("SUMMIT_MESH__MAX_HOPS") {
            if let Ok(p) = v.parse() {
                self.mesh.max_hops = p;
            }
        }
        if let Ok(v) = std::env::var("SUMMIT_MESH__FRAGMENT_SIZE") {
            if let Ok(p) = v.parse() {
                self.mesh.fragment_size = p;
            }
        }
        if let Ok(v) = std::env::var("SUMMIT_STORE_AND_FORWARD__MAX_TOTAL") {
            if let Ok(p) = v.parse() {
                self.store_and_forward.max_total = p;
            }
        }
        if let Ok(v) = std::env::var("SUMMIT_TRANSPORT__POLICY") {
            self.transport.policy = match v.to_ascii_lowercase().as_str() {
                "ble_only" => TransportPolicyConfig::BleOnly,
                "wifi_only" => TransportPolicyConfig::WifiOnly,
                "redundant" => TransportPolicyConfig::Redundant,
                _ => TransportPolicyConfig::Auto,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.mesh.max_hops, 7);
        assert_eq!(config.mesh.max_message_size, 500);
        assert_eq!(config.mesh.fragment_size, 180);
        assert_eq!(config.mesh.bloom_size_bits, 2048);
        assert_eq!(config.mesh.bloom_hash_count, 7);
        assert_eq!(config.network.max_peers, 8);
        assert_eq!(config.transport.policy, TransportPolicyConfig::Auto);
    }

    #[test]
    fn apply_env_overrides_changes_max_hops() {
        let mut config = MeshConfig::default();
        assert_eq!(config.mesh.max_hops, 7);
        config.mesh.max_hops = 3;
        assert_eq!(config.mesh.max_hops, 3);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("summit-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("SUMMIT_CONFIG", config_path.to_str().unwrap());
        }

        let path = MeshConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeshConfig::load().expect("load should succeed");
        assert_eq!(config.mesh.max_hops, 7);

        unsafe {
            std::env::remove_var("SUMMIT_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
