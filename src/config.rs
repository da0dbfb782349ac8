//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use crate::error::{VpnError, VpnResult};

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnConfig {
    /// NetworkManager backend settings
    #[serde(default)]
    pub networkmanager: NetworkManagerSettings,
    /// SystemConfiguration backend settings
    #[serde(default)]
    pub scutil: ScutilSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkManagerSettings {
    /// `connection.type` values treated as VPN connections
    #[serde(default = "default_connection_types")]
    pub connection_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScutilSettings {
    /// Interface types treated as VPN services
    #[serde(default = "default_interface_types")]
    pub interface_types: Vec<String>,
    /// Path or name of the scutil binary
    #[serde(default = "default_scutil_binary")]
    pub binary: String,
    /// Status poll period (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_connection_types() -> Vec<String> {
    vec!["vpn".to_string(), "wireguard".to_string()]
}

fn default_interface_types() -> Vec<String> {
    vec!["VPN".to_string(), "IPSec".to_string()]
}

fn default_scutil_binary() -> String {
    "scutil".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for NetworkManagerSettings {
    fn default() -> Self {
        Self {
            connection_types: default_connection_types(),
        }
    }
}

impl Default for ScutilSettings {
    fn default() -> Self {
        Self {
            interface_types: default_interface_types(),
            binary: default_scutil_binary(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ScutilSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl VpnConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, falling back to defaults when no file is given or it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> VpnResult<Self> {
        match path {
            Some(path) if path.as_ref().exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: VpnConfig = toml::from_str("").unwrap();
        assert_eq!(config, VpnConfig::default());
        assert_eq!(config.networkmanager.connection_types, vec!["vpn", "wireguard"]);
        assert_eq!(config.scutil.interface_types, vec!["VPN", "IPSec"]);
        assert_eq!(config.scutil.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_section() {
        let config: VpnConfig = toml::from_str(
            "[scutil]\npoll_interval_ms = 500\n",
        )
        .unwrap();
        assert_eq!(config.scutil.poll_interval_ms, 500);
        assert_eq!(config.scutil.binary, "scutil");
        assert_eq!(config.networkmanager, NetworkManagerSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnctl.toml");

        let mut config = VpnConfig::default();
        config.networkmanager.connection_types = vec!["vpn".to_string()];
        config.save(&path).unwrap();

        let loaded = VpnConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = VpnConfig::load_or_default(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, VpnConfig::default());

        let config = VpnConfig::load_or_default(None::<&Path>).unwrap();
        assert_eq!(config, VpnConfig::default());
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "networkmanager = 3").unwrap();
        assert!(matches!(VpnConfig::load(&path), Err(VpnError::ConfigError(_))));
    }
}
