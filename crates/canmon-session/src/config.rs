//! canmon configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no
//! file at all) yields a working mock setup.
//!
//! ```toml
//! preferences_path = "/var/lib/canmon/preferences.json"
//!
//! [driver]
//! type = "socketcan"
//! interface_prefix = "can"
//!
//! [monitor]
//! max_consecutive_read_errors = 100
//!
//! [discovery]
//! interval_ms = 5000
//!
//! [[devices]]
//! device = "USBBUS1"
//! baud = "500k"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use canmon_core::{BaudRate, LogicalDeviceId};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanmonConfig {
    /// Bus driver selection
    #[serde(default)]
    pub driver: DriverConfig,
    /// Frame monitor tuning
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Device list refresh
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Baud-rate memory file (JSON). Defaults to the platform config dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences_path: Option<PathBuf>,
    /// Sessions to start at launch
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl CanmonConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "monitor.event_capacity must be at least 1".to_string(),
            ));
        }
        if self.discovery.enabled && self.discovery.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.interval_ms must be non-zero".to_string(),
            ));
        }
        if let Some(blank) = self.devices.iter().find(|d| d.device.is_blank()) {
            return Err(ConfigError::Invalid(format!(
                "devices entry with blank device id: {:?}",
                blank
            )));
        }
        Ok(())
    }

    /// Where baud-rate preferences are stored
    pub fn resolved_preferences_path(&self) -> Option<PathBuf> {
        self.preferences_path
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("canmon").join("preferences.json")))
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Bus driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    /// SocketCAN raw sockets (Linux only)
    SocketCan(SocketCanConfig),
    /// In-memory driver for testing and demos
    Mock(MockConfig),
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Handle N maps to interface `{prefix}{N-1}` (`can0` for handle 1)
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
    /// Set the interface bitrate over netlink on initialize (needs
    /// CAP_NET_ADMIN and the interface down). Off by default: most setups
    /// configure the bitrate with `ip link`.
    #[serde(default)]
    pub configure_bitrate: bool,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface_prefix: default_interface_prefix(),
            configure_bitrate: false,
        }
    }
}

fn default_interface_prefix() -> String {
    "can".to_string()
}

/// Mock driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Channel numbers that report hardware present
    #[serde(default = "default_mock_channels")]
    pub channels: Vec<u8>,
    /// Simulated latency of initialize/uninitialize in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            channels: default_mock_channels(),
            latency_ms: 0,
        }
    }
}

fn default_mock_channels() -> Vec<u8> {
    vec![1]
}

// =============================================================================
// Monitor Configuration
// =============================================================================

/// Frame monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Capacity of the frame event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Pause after an empty read in microseconds (0 = yield and retry)
    #[serde(default)]
    pub idle_sleep_us: u64,
    /// Pause after a failed read in milliseconds
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
    /// Consecutive failed reads before the session is marked faulted
    /// (0 = never give up)
    #[serde(default = "default_max_read_errors")]
    pub max_consecutive_read_errors: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            idle_sleep_us: 0,
            error_backoff_ms: default_error_backoff(),
            max_consecutive_read_errors: default_max_read_errors(),
        }
    }
}

impl MonitorConfig {
    pub fn idle_sleep(&self) -> Option<Duration> {
        (self.idle_sleep_us > 0).then(|| Duration::from_micros(self.idle_sleep_us))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

fn default_event_capacity() -> usize {
    1024
}

fn default_error_backoff() -> u64 {
    10
}

fn default_max_read_errors() -> u32 {
    100
}

// =============================================================================
// Discovery Configuration
// =============================================================================

/// Device list refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Liveness poll period in milliseconds
    #[serde(default = "default_discovery_interval")]
    pub interval_ms: u64,
    /// Stop sessions whose device disappears from the device list
    #[serde(default = "default_true")]
    pub stop_on_unplug: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_discovery_interval(),
            stop_on_unplug: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_discovery_interval() -> u64 {
    5000
}

// =============================================================================
// Device Autostart
// =============================================================================

/// A session to start at launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device: LogicalDeviceId,
    /// Falls back to the remembered rate, then 500 kbit/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<BaudRate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CanmonConfig::from_toml_str("").unwrap();
        assert!(matches!(config.driver, DriverConfig::Mock(_)));
        assert_eq!(config.monitor.event_capacity, 1024);
        assert_eq!(config.monitor.idle_sleep(), None);
        assert_eq!(config.discovery.interval(), Duration::from_secs(5));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = CanmonConfig::from_toml_str(
            r#"
preferences_path = "/tmp/canmon-prefs.json"

[driver]
type = "socketcan"
interface_prefix = "vcan"

[monitor]
idle_sleep_us = 50
max_consecutive_read_errors = 0

[discovery]
interval_ms = 1000
stop_on_unplug = false

[[devices]]
device = "USBBUS1"
baud = "250k"

[[devices]]
device = "USBBUS2"
"#,
        )
        .unwrap();

        match &config.driver {
            DriverConfig::SocketCan(cfg) => {
                assert_eq!(cfg.interface_prefix, "vcan");
                assert!(!cfg.configure_bitrate);
            }
            other => panic!("Expected socketcan driver, got {:?}", other),
        }
        assert_eq!(config.monitor.idle_sleep(), Some(Duration::from_micros(50)));
        assert_eq!(config.monitor.max_consecutive_read_errors, 0);
        assert!(!config.discovery.stop_on_unplug);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].baud, Some(BaudRate::Baud250K));
        assert_eq!(config.devices[1].baud, None);
        assert_eq!(
            config.resolved_preferences_path(),
            Some(PathBuf::from("/tmp/canmon-prefs.json"))
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(CanmonConfig::from_toml_str("[monitor]\nevent_capacity = 0").is_err());
        assert!(CanmonConfig::from_toml_str("[[devices]]\ndevice = \"  \"").is_err());
        assert!(CanmonConfig::from_toml_str("[[devices]]\ndevice = \"D1\"\nbaud = \"33k\"").is_err());
        assert!(CanmonConfig::from_toml_str("[driver]\ntype = \"pcan\"").is_err());
    }
}
