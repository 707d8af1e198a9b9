//! Native Tunnel Bridge Configuration
//!
//! The native tunnel bridges the virtual interface to the engine's
//! local SOCKS listener. Its configuration is generated from session
//! settings, never supplied by the user.
//!
//! ```yaml
//! tunnel:
//!   name: tun0
//!   mtu: 1500
//!   ipv4: 10.0.0.2
//! socks5:
//!   address: 127.0.0.1
//!   port: 10808
//!   udp: udp
//! misc:
//!   log-level: info
//! ```

use crate::config::VpnSettings;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How UDP is carried to the SOCKS listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// SOCKS5 UDP associate
    Udp,
    /// UDP over the TCP stream
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSection {
    pub name: String,
    pub mtu: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Section {
    pub address: String,
    pub port: u16,
    pub udp: UdpMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiscSection {
    #[serde(rename = "log-level")]
    pub log_level: String,
}

/// Bridge configuration handed to the native tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub tunnel: TunnelSection,
    pub socks5: Socks5Section,
    pub misc: MiscSection,
}

impl BridgeConfig {
    /// Derive the bridge configuration from session settings
    pub fn from_settings(settings: &VpnSettings) -> Self {
        let iface = &settings.interface;
        let (ipv4, ipv6) = match iface.address {
            addr @ IpAddr::V4(_) => (Some(addr), None),
            addr @ IpAddr::V6(_) => (None, Some(addr)),
        };

        // Credentials only count when both halves are present
        let credentials = match (&settings.tunnel.username, &settings.tunnel.password) {
            (Some(user), Some(pass)) if !user.trim().is_empty() && !pass.trim().is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        };
        let (username, password) = credentials.unzip();

        Self {
            tunnel: TunnelSection {
                name: settings.tunnel.device_name.clone(),
                mtu: iface.mtu,
                ipv4,
                ipv6,
            },
            socks5: Socks5Section {
                address: settings.inbound.listen.clone(),
                port: settings.inbound.port,
                udp: if settings.inbound.udp { UdpMode::Udp } else { UdpMode::Tcp },
                username,
                password,
            },
            misc: MiscSection {
                log_level: settings.tunnel.log_level.clone(),
            },
        }
    }

    /// Render as the YAML document the native tunnel reads
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}
