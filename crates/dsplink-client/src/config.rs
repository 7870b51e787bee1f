//! Device configuration.
//!
//! ```yaml
//! host: 192.168.0.20
//! pin: "000000"
//! model: W245
//! scan_interval_secs: 5
//! ```

use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use dsplink_protocol::Model;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::transport::{TlsConnector, DEFAULT_PORT};

/// Default display name.
pub const DEFAULT_NAME: &str = "D-Link Smart Plug";
/// Default poll interval in seconds.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 5;
/// Accepted poll intervals in seconds.
pub const SCAN_INTERVAL_RANGE: RangeInclusive<u64> = 1..=300;
/// Default TCP connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for one plug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Host name or IP address.
    pub host: String,
    /// PIN printed on the device label.
    pub pin: String,
    /// Plug model.
    #[serde(default)]
    pub model: Model,
    /// Display name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Seconds between polls.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Device port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl DeviceConfig {
    /// Config with defaults for everything but `host` and `pin`.
    pub fn new(host: impl Into<String>, pin: impl Into<String>) -> Self {
        DeviceConfig {
            host: host.into(),
            pin: pin.into(),
            model: Model::default(),
            name: default_name(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            port: DEFAULT_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Parse YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Read and parse a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check required fields and ranges.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::Config("host must not be empty".into()));
        }
        if self.pin.trim().is_empty() {
            return Err(ClientError::Config("pin must not be empty".into()));
        }
        if !SCAN_INTERVAL_RANGE.contains(&self.scan_interval_secs) {
            return Err(ClientError::Config(format!(
                "scan_interval_secs must be between {} and {}, got {}",
                SCAN_INTERVAL_RANGE.start(),
                SCAN_INTERVAL_RANGE.end(),
                self.scan_interval_secs
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ClientError::Config("connect_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Poll interval.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// TLS connector for this device.
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::new(self.host.trim())
            .with_port(self.port)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = DeviceConfig::from_yaml_str("host: 192.168.0.20\npin: \"000000\"\n")
            .expect("should parse");
        assert_eq!(config, DeviceConfig::new("192.168.0.20", "000000"));
        assert_eq!(config.model, Model::W245);
        assert_eq!(config.port, 8080);
        assert_eq!(config.name, "D-Link Smart Plug");
        assert_eq!(config.scan_interval(), Duration::from_secs(5));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
host: plug.lan
pin: "123456"
model: W115
name: Kettle
scan_interval_secs: 30
port: 9443
connect_timeout_secs: 3
"#;
        let config = DeviceConfig::from_yaml_str(yaml).expect("should parse");
        assert_eq!(config.model, Model::W115);
        assert_eq!(config.name, "Kettle");
        assert_eq!(config.port, 9443);

        let connector = config.connector();
        assert_eq!(connector.host(), "plug.lan");
        assert_eq!(connector.port(), 9443);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = DeviceConfig::from_yaml_str("host: a\npin: b\nverbose: 2\n").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = DeviceConfig::new("plug.lan", "000000");
        config.scan_interval_secs = 0;
        assert!(config.validate().is_err());
        config.scan_interval_secs = 301;
        assert!(config.validate().is_err());
        config.scan_interval_secs = 300;
        assert!(config.validate().is_ok());

        assert!(DeviceConfig::new(" ", "000000").validate().is_err());
        assert!(DeviceConfig::new("plug.lan", "").validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = DeviceConfig::from_yaml_file("/nonexistent/dsplink.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dsplink.yaml"));
    }
}
