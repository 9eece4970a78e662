use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Bridge configuration. Loaded once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// BLE adapter used for both the treadmill connection and FTMS
    /// advertising (e.g. "hci0"). `None` picks the first adapter.
    #[serde(default)]
    pub ble_adapter: Option<String>,

    /// Local name advertised by the FTMS peripheral.
    #[serde(default = "default_ftms_device_name")]
    pub ftms_device_name: String,

    /// Seconds between scan passes while searching for a treadmill.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_s: f64,

    /// Stats poll interval to the treadmill (ms) while connected. Also the
    /// FTMS notification cadence.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,

    /// Start the FTMS bridge automatically after connecting.
    #[serde(default = "default_true")]
    pub auto_start_bridge: bool,

    /// Drive scan/connect automatically; `false` leaves all arcs to the
    /// control facade.
    #[serde(default = "default_true")]
    pub auto_mode: bool,
}

fn default_ftms_device_name() -> String {
    "WalkPad FTMS".to_string()
}

fn default_scan_interval() -> f64 {
    5.0
}

fn default_stats_interval() -> u64 {
    750
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ble_adapter: None,
            ftms_device_name: default_ftms_device_name(),
            scan_interval_s: default_scan_interval(),
            stats_interval_ms: default_stats_interval(),
            auto_start_bridge: true,
            auto_mode: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the bridge state machine cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.ftms_device_name.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "ftms_device_name must not be empty".into(),
            ));
        }
        if !(self.scan_interval_s > 0.0) {
            return Err(BridgeError::InvalidConfig(format!(
                "scan_interval_s must be positive, got {}",
                self.scan_interval_s
            )));
        }
        if !(200..=5000).contains(&self.stats_interval_ms) {
            return Err(BridgeError::InvalidConfig(format!(
                "stats_interval_ms must be in [200, 5000], got {}",
                self.stats_interval_ms
            )));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval_s)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Watchdog window for the missed-response check.
    pub fn watchdog_window(&self) -> Duration {
        Duration::from_millis((3 * self.stats_interval_ms).max(3000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stats_interval_ms, 750);
        assert!(config.auto_mode);
        assert!(config.auto_start_bridge);
        assert!(config.ble_adapter.is_none());
    }

    #[test]
    fn toml_round_trip() {
        let config = Config {
            ble_adapter: Some("hci1".into()),
            ftms_device_name: "Office Pad".into(),
            scan_interval_s: 2.5,
            stats_interval_ms: 500,
            auto_start_bridge: false,
            auto_mode: false,
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.ble_adapter.as_deref(), Some("hci1"));
        assert_eq!(back.ftms_device_name, "Office Pad");
        assert_eq!(back.stats_interval_ms, 500);
        assert!(!back.auto_mode);
    }

    #[test]
    fn partial_file_uses_field_defaults() {
        let config: Config = toml::from_str("stats_interval_ms = 1000\n").unwrap();
        assert_eq!(config.stats_interval_ms, 1000);
        assert_eq!(config.scan_interval_s, 5.0);
        assert_eq!(config.ftms_device_name, "WalkPad FTMS");
    }

    #[test]
    fn interval_bounds_rejected() {
        let mut config = Config::default();
        config.stats_interval_ms = 100;
        assert!(config.validate().is_err());
        config.stats_interval_ms = 5001;
        assert!(config.validate().is_err());
        config.stats_interval_ms = 200;
        assert!(config.validate().is_ok());

        config.scan_interval_s = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn watchdog_window_has_floor() {
        let mut config = Config::default();
        config.stats_interval_ms = 200;
        assert_eq!(config.watchdog_window(), Duration::from_millis(3000));
        config.stats_interval_ms = 2000;
        assert_eq!(config.watchdog_window(), Duration::from_millis(6000));
    }
}
