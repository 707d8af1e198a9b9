//! VPN Configuration
//!
//! Settings for the local listener, the virtual interface, the native
//! tunnel bridge, probing and session supervision. Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! [inbound]
//! port = 10808
//!
//! [interface]
//! mtu = 1500
//! dns = ["8.8.8.8", "1.1.1.1"]
//!
//! [probe]
//! timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Local SOCKS listener the engine exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundSettings {
    /// Loopback host
    pub listen: String,
    /// Listener port
    pub port: u16,
    /// Relay UDP through the listener
    pub udp: bool,
}

impl Default for InboundSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 10808,
            udp: true,
        }
    }
}

/// Virtual network interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Session label shown by the OS
    pub session_name: String,
    /// Interface MTU
    pub mtu: u16,
    /// Point-to-point address of the interface
    pub address: IpAddr,
    /// Prefix length of `address`
    pub prefix_len: u8,
    /// Resolvers pushed to the interface
    pub dns: Vec<IpAddr>,
    /// Default route (`0.0.0.0/0`)
    pub route: IpAddr,
    pub route_prefix_len: u8,
    /// Keep our own traffic out of the tunnel
    pub exclude_self: bool,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            session_name: "V2Ray VPN".to_string(),
            mtu: 1500,
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            prefix_len: 32,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),   // Google
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),   // Cloudflare
            ],
            route: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            route_prefix_len: 0,
            exclude_self: true,
        }
    }
}

/// Native tunnel bridge parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Tunnel device name
    pub device_name: String,
    /// Optional SOCKS credentials (used only when both are set)
    pub username: Option<String>,
    pub password: Option<String>,
    /// Native tunnel log level
    pub log_level: String,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            device_name: "tun0".to_string(),
            username: None,
            password: None,
            log_level: "info".to_string(),
        }
    }
}

/// Latency probe parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Well-known endpoint measured through each candidate
    pub test_url: String,
    /// Upper bound per probe
    pub timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            test_url: "https://www.google.com".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session supervision parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Watchdog poll interval
    pub watchdog_interval_ms: u64,
    /// Bounded wait for the tunnel task on stop
    pub stop_timeout_ms: u64,
    /// Proxy-core log level written into the engine config
    pub engine_log_level: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: 2000,
            stop_timeout_ms: 5000,
            engine_log_level: "warning".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnSettings {
    pub inbound: InboundSettings,
    pub interface: InterfaceSettings,
    pub tunnel: TunnelSettings,
    pub probe: ProbeSettings,
    pub session: SessionSettings,
}

impl VpnSettings {
    /// Load from a TOML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let settings = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Local proxy URL served by the engine
    pub fn proxy_url(&self) -> String {
        format!("socks5://{}:{}", self.inbound.listen, self.inbound.port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound.port == 0 {
            return Err(ConfigError::Invalid("inbound port must be non-zero".into()));
        }
        if self.interface.mtu == 0 {
            return Err(ConfigError::Invalid("interface mtu must be non-zero".into()));
        }
        if self.interface.dns.is_empty() {
            return Err(ConfigError::Invalid("at least one DNS resolver is required".into()));
        }
        let max_prefix = if self.interface.address.is_ipv4() { 32 } else { 128 };
        if self.interface.prefix_len > max_prefix {
            return Err(ConfigError::Invalid(format!(
                "prefix length {} exceeds {}",
                self.interface.prefix_len, max_prefix
            )));
        }
        if self.session.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid("watchdog interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = VpnSettings::default();

        assert_eq!(settings.inbound.port, 10808);
        assert_eq!(settings.interface.mtu, 1500);
        assert_eq!(settings.interface.address.to_string(), "10.0.0.2");
        assert_eq!(settings.interface.dns.len(), 2);
        assert_eq!(settings.session.watchdog_interval(), Duration::from_secs(2));
        assert_eq!(settings.session.stop_timeout(), Duration::from_secs(5));
        assert_eq!(settings.proxy_url(), "socks5://127.0.0.1:10808");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let settings = VpnSettings::from_toml(
            r#"
            [inbound]
            port = 20808

            [probe]
            timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(settings.inbound.port, 20808);
        assert_eq!(settings.inbound.listen, "127.0.0.1");
        assert_eq!(settings.probe.timeout(), Duration::from_millis(1500));
        assert_eq!(settings.interface, InterfaceSettings::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = VpnSettings::default();
        let parsed = VpnSettings::from_toml(&settings.to_toml()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_validation() {
        let mut settings = VpnSettings::default();
        settings.interface.dns.clear();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = VpnSettings::default();
        settings.inbound.port = 0;
        assert!(settings.validate().is_err());

        let mut settings = VpnSettings::default();
        settings.interface.prefix_len = 33;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(toml_file, "[interface]\nmtu = 1400").unwrap();
        assert_eq!(VpnSettings::load(toml_file.path()).unwrap().interface.mtu, 1400);

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(json_file, r#"{{"session": {{"stop_timeout_ms": 100}}}}"#).unwrap();
        assert_eq!(VpnSettings::load(json_file.path()).unwrap().session.stop_timeout_ms, 100);

        let yaml_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            VpnSettings::load(yaml_file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
