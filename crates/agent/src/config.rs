//! Configuration for the tapmesh agent.
//!
//! TOML-based configuration with defaults, environment overrides and a
//! validation pass that refuses to start on bad values before any side
//! effect like opening the tap device or dialing the signaler.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{MacAddr, KEY_LENGTHS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default STUN server for ICE.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default signaler address.
pub const DEFAULT_SIGNALER_URL: &str = "ws://127.0.0.1:15325";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("community must be non-empty and not \"-1\", got \"{0}\"")]
    InvalidCommunity(String),

    #[error("community key must be empty or 16/24/32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("interface mac \"{0}\" does not parse")]
    InvalidMac(String),

    #[error("signaler_url must start with ws:// or wss://, got {0}")]
    InvalidSignalerUrl(String),

    #[error("mtu must be between 576 and 9216, got {0}")]
    InvalidMtu(usize),

    #[error("at least one ICE server is required")]
    NoIceServers,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,
}

/// Main configuration structure for the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Tap interface settings.
    pub interface: InterfaceConfig,

    /// Community and signaler settings.
    pub network: NetworkConfig,

    /// Signaler trust settings.
    pub security: SecurityConfig,
}

/// Tap interface settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface name.
    pub name: String,

    /// Interface MTU.
    pub mtu: usize,

    /// Hardware address claimed in the community.
    pub mac: String,
}

/// Community and signaler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Community to join.
    pub community: String,

    /// Signaler websocket URL.
    pub signaler_url: String,

    /// STUN/TURN servers handed to the ICE agent.
    pub ice_servers: Vec<String>,

    /// Community pre-shared key; empty disables payload encryption.
    pub key: String,

    /// Keep-alive interval and send deadline in seconds.
    pub timeout_secs: u64,
}

/// Signaler trust settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Path of the known-hosts file pinning signaler certificates.
    pub known_hosts: PathBuf,

    /// Pin unknown signalers on first contact instead of refusing them.
    pub accept_new: bool,

    /// Skip certificate verification entirely.
    pub insecure: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "tapmesh0".to_string(),
            mtu: 1500,
            mac: "02:00:00:00:00:01".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            community: "cluster1".to_string(),
            signaler_url: DEFAULT_SIGNALER_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            key: String::new(),
            timeout_secs: 10,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            known_hosts: crate::known_hosts::KnownHosts::default_path(),
            accept_new: false,
            insecure: false,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tapmesh")
        .join("agent.toml")
}

impl AgentConfig {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values:
    /// - `TAPMESH_SIGNALER_URL` overrides the signaler address
    /// - `TAPMESH_COMMUNITY_KEY` overrides the community key
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TAPMESH_SIGNALER_URL") {
            if !url.is_empty() {
                tracing::info!(%url, "overriding signaler_url from environment");
                self.network.signaler_url = url;
            }
        }

        if let Ok(key) = std::env::var("TAPMESH_COMMUNITY_KEY") {
            if !key.is_empty() {
                tracing::info!("overriding community key from environment");
                self.network.key = key;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let community = &self.network.community;
        if community.is_empty() || community == "-1" {
            return Err(ConfigError::InvalidCommunity(community.clone()));
        }

        let key_len = self.network.key.len();
        if key_len != 0 && !KEY_LENGTHS.contains(&key_len) {
            return Err(ConfigError::InvalidKeyLength(key_len));
        }

        if self.interface.mac.parse::<MacAddr>().is_err() {
            return Err(ConfigError::InvalidMac(self.interface.mac.clone()));
        }

        let url = &self.network.signaler_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalerUrl(url.clone()));
        }

        if self.interface.mtu < 576 || self.interface.mtu > 9216 {
            return Err(ConfigError::InvalidMtu(self.interface.mtu));
        }

        if self.network.ice_servers.is_empty() {
            return Err(ConfigError::NoIceServers);
        }

        if self.network.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(())
    }

    /// The hardware address, canonicalized. Call after [`validate`].
    pub fn mac(&self) -> Result<MacAddr, ConfigError> {
        self.interface
            .mac
            .parse()
            .map_err(|_| ConfigError::InvalidMac(self.interface.mac.clone()))
    }

    /// The keep-alive interval and send deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|err| anyhow::anyhow!("Invalid TOML configuration: {err}"))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_validates() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interface.name, "tapmesh0");
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(config.network.ice_servers, vec![DEFAULT_STUN_SERVER]);
        assert_eq!(config.network.timeout_secs, 10);
        assert!(!config.security.accept_new);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[network]
community = "ops"
key = "0123456789abcdef"
"#;
        let config = AgentConfig::from_toml(toml).unwrap();
        assert_eq!(config.network.community, "ops");
        assert_eq!(config.network.key, "0123456789abcdef");
        // Untouched sections keep their defaults.
        assert_eq!(config.interface.mtu, 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[interface]
name = "mesh0"
mtu = 1400
mac = "02:aa:bb:cc:dd:ee"

[network]
community = "lab"
signaler_url = "wss://signal.example.org:15325"
ice_servers = ["stun:stun.example.org:3478", "turn:turn.example.org:3478"]
key = "0123456789abcdef01234567"
timeout_secs = 5

[security]
known_hosts = "/etc/tapmesh/known_hosts"
accept_new = true
insecure = false
"#;
        let config = AgentConfig::from_toml(toml).unwrap();
        assert_eq!(config.interface.name, "mesh0");
        assert_eq!(config.network.ice_servers.len(), 2);
        assert_eq!(config.network.key.len(), 24);
        assert!(config.security.accept_new);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_community() {
        let mut config = AgentConfig::default();

        config.network.community = String::new();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCommunity(String::new()))
        );

        config.network.community = "-1".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCommunity("-1".to_string()))
        );
    }

    #[test]
    fn test_validate_key_lengths() {
        let mut config = AgentConfig::default();

        for len in [16, 24, 32] {
            config.network.key = "k".repeat(len);
            assert!(config.validate().is_ok(), "len {len}");
        }

        config.network.key = "short".to_string();
        assert_eq!(config.validate(), Err(ConfigError::InvalidKeyLength(5)));

        config.network.key = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_mac() {
        let mut config = AgentConfig::default();
        config.interface.mac = "not-a-mac".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMac("not-a-mac".to_string()))
        );
    }

    #[test]
    fn test_validate_signaler_url() {
        let mut config = AgentConfig::default();

        config.network.signaler_url = "https://example.org".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSignalerUrl(_))
        ));

        config.network.signaler_url = "wss://example.org:15325".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_mtu_bounds() {
        let mut config = AgentConfig::default();

        config.interface.mtu = 100;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu(100)));

        config.interface.mtu = 576;
        assert!(config.validate().is_ok());

        config.interface.mtu = 9216;
        assert!(config.validate().is_ok());

        config.interface.mtu = 20000;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu(20000)));
    }

    #[test]
    fn test_validate_ice_servers() {
        let mut config = AgentConfig::default();
        config.network.ice_servers.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoIceServers));
    }

    #[test]
    fn test_validate_timeout() {
        let mut config = AgentConfig::default();
        config.network.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout));
    }

    #[test]
    fn test_mac_canonicalizes() {
        let mut config = AgentConfig::default();
        config.interface.mac = "02:AA:BB:CC:DD:EE".to_string();
        assert_eq!(config.mac().unwrap().to_string(), "02:aa:bb:cc:dd:ee");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("agent.toml");

        let mut original = AgentConfig::default();
        original.network.community = "roundtrip".to_string();
        original.interface.mtu = 1400;

        original.save(&path).unwrap();
        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AgentConfig::load("/nonexistent/agent.toml").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "invalid [ toml").unwrap();

        assert!(AgentConfig::load(&path).is_err());
    }
}
