//! Config Translator
//!
//! Turns a `vless://` connection URI into the structured document the
//! proxy-core engine consumes.
//!
//! # Output Layout
//!
//! ```text
//! log        { loglevel }
//! inbounds   [ socks @ 127.0.0.1:10808, sniffing http/tls ]
//! outbounds  [ proxy (vless + streamSettings), direct (freedom), block (blackhole) ]
//! ```
//!
//! Translation is pure and never panics, so it is safe to call
//! speculatively on every candidate during probing.

use crate::config::VpnSettings;
use crate::uri::{ConnectionUri, UriError};
use serde::{Deserialize, Serialize};

/// Scheme accepted by the translator
pub const PROXY_SCHEME: &str = "vless";

/// Protocol name of the proxy outbound
pub const PROXY_PROTOCOL: &str = "vless";

/// Tag of the local SOCKS inbound
pub const INBOUND_TAG: &str = "socks";

/// Tag of the proxy outbound
pub const PROXY_TAG: &str = "proxy";

/// Translation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Malformed connection URI: {0}")]
    Uri(#[from] UriError),
}

/// Complete engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

/// Local listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub sniffing: Sniffing,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub auth: String,
    pub udp: bool,
}

/// Outbound handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

impl Outbound {
    /// Outbound with no settings (freedom, blackhole)
    pub fn bare(tag: &str, protocol: &str) -> Self {
        Self {
            tag: tag.to_string(),
            protocol: protocol.to_string(),
            settings: None,
            stream_settings: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSettings {
    pub vnext: Vec<UpstreamServer>,
}

/// Upstream proxy target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<UpstreamUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamUser {
    pub id: String,
    pub encryption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

/// Transport and security blocks of the proxy outbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
    pub headers: WsHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

impl EngineConfig {
    /// Compact JSON for the engine
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Indented JSON for logs and the CLI
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// The `proxy` outbound, if present
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == PROXY_TAG)
    }

    /// Upstream address and port of the proxy outbound
    pub fn proxy_target(&self) -> Option<(&str, u16)> {
        self.proxy_outbound()
            .and_then(|o| o.settings.as_ref())
            .and_then(|s| s.vnext.first())
            .map(|v| (v.address.as_str(), v.port))
    }

    /// The local SOCKS inbound
    pub fn socks_inbound(&self) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag == INBOUND_TAG)
    }
}

/// Translator with the local listener and log level baked in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTranslator {
    /// Loopback address of the SOCKS inbound
    pub listen: String,
    /// Port of the SOCKS inbound
    pub port: u16,
    /// Accept UDP on the inbound
    pub udp: bool,
    /// Engine log level
    pub log_level: String,
}

impl Default for ConfigTranslator {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 10808,
            udp: true,
            log_level: "warning".to_string(),
        }
    }
}

impl ConfigTranslator {
    /// Build from orchestrator settings
    pub fn from_settings(settings: &VpnSettings) -> Self {
        Self {
            listen: settings.inbound.listen.clone(),
            port: settings.inbound.port,
            udp: settings.inbound.udp,
            log_level: settings.session.engine_log_level.clone(),
        }
    }

    /// Translate a connection URI into an engine configuration
    pub fn translate(&self, uri: &str) -> Result<EngineConfig, TranslateError> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(UriError::Empty.into());
        }

        // Scheme is validated before anything else, case-sensitively
        match trimmed.split_once("://") {
            Some((scheme, _)) if scheme == PROXY_SCHEME => {}
            Some((scheme, _)) => return Err(TranslateError::UnsupportedScheme(scheme.to_string())),
            None => return Err(UriError::MissingScheme.into()),
        }

        let parsed = ConnectionUri::parse(trimmed)?;
        Ok(self.build(&parsed))
    }

    fn build(&self, uri: &ConnectionUri) -> EngineConfig {
        let inbound = Inbound {
            tag: INBOUND_TAG.to_string(),
            port: self.port,
            listen: self.listen.clone(),
            protocol: "socks".to_string(),
            sniffing: Sniffing {
                enabled: true,
                dest_override: vec!["http".to_string(), "tls".to_string()],
            },
            settings: InboundSettings {
                auth: "noauth".to_string(),
                udp: self.udp,
            },
        };

        let flow = uri.param("flow").filter(|f| !f.trim().is_empty());
        let user = UpstreamUser {
            id: uri.credential.clone(),
            encryption: uri.param_or("encryption", "none").to_string(),
            flow: flow.map(str::to_string),
        };

        let proxy = Outbound {
            tag: PROXY_TAG.to_string(),
            protocol: PROXY_PROTOCOL.to_string(),
            settings: Some(OutboundSettings {
                vnext: vec![UpstreamServer {
                    address: uri.host.clone(),
                    port: uri.port,
                    users: vec![user],
                }],
            }),
            stream_settings: Some(stream_settings(uri)),
        };

        EngineConfig {
            log: LogSettings {
                loglevel: self.log_level.clone(),
            },
            inbounds: vec![inbound],
            outbounds: vec![
                proxy,
                Outbound::bare("direct", "freedom"),
                Outbound::bare("block", "blackhole"),
            ],
        }
    }
}

/// Translate with default listener settings
pub fn translate(uri: &str) -> Result<EngineConfig, TranslateError> {
    ConfigTranslator::default().translate(uri)
}

fn stream_settings(uri: &ConnectionUri) -> StreamSettings {
    let network = uri.param_or("type", "tcp");
    let security = uri.param_or("security", "none");
    let address = uri.host.as_str();

    let mut stream = StreamSettings {
        network: network.to_string(),
        security: security.to_string(),
        ws_settings: None,
        grpc_settings: None,
        tcp_settings: None,
        tls_settings: None,
        reality_settings: None,
    };

    match network {
        "ws" => {
            stream.ws_settings = Some(WsSettings {
                path: uri.param_or("path", "/").to_string(),
                headers: WsHeaders {
                    host: uri.param_or("host", address).to_string(),
                },
            });
        }
        "grpc" => {
            stream.grpc_settings = Some(GrpcSettings {
                service_name: uri.param_or("serviceName", "").to_string(),
                multi_mode: uri.param("mode") == Some("multi"),
            });
        }
        "tcp" => {
            stream.tcp_settings = uri
                .param("headerType")
                .filter(|t| *t != "none")
                .map(|t| TcpSettings {
                    header: TcpHeader { kind: t.to_string() },
                });
        }
        // Other transports pass through with no settings block
        _ => {}
    }

    match security {
        "tls" => {
            stream.tls_settings = Some(TlsSettings {
                server_name: uri.param_or("sni", address).to_string(),
                allow_insecure: parse_strict_bool(uri.param("allowInsecure")).unwrap_or(false),
                fingerprint: uri.param("fp").map(str::to_string),
                alpn: uri
                    .param("alpn")
                    .map(|a| a.split(',').map(str::to_string).collect()),
            });
        }
        "reality" => {
            stream.reality_settings = Some(RealitySettings {
                server_name: uri.param_or("sni", address).to_string(),
                public_key: uri.param_or("pbk", "").to_string(),
                fingerprint: uri.param("fp").map(str::to_string),
                short_id: uri.param("sid").map(str::to_string),
            });
        }
        _ => {}
    }

    stream
}

/// Only the exact literals `true` / `false` count
fn parse_strict_bool(value: Option<&str>) -> Option<bool> {
    match value? {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const WS_TLS: &str = "vless://11111111-2222-3333-4444-555555555555@de1.example.net:443\
        ?type=ws&security=tls&path=%2Fray&host=cdn.example.net&fp=chrome&alpn=h2,http/1.1\
        &encryption=none&flow=xtls-rprx-vision#Frankfurt";

    #[test]
    fn test_ws_tls_shape() {
        let config = translate(WS_TLS).unwrap();

        assert_eq!(config.inbounds.len(), 1);
        assert_eq!(config.outbounds.len(), 3);

        let proxy = config.proxy_outbound().unwrap();
        let stream = proxy.stream_settings.as_ref().unwrap();
        let ws = stream.ws_settings.as_ref().unwrap();
        let tls = stream.tls_settings.as_ref().unwrap();

        assert_eq!(ws.path, "/ray");
        assert_eq!(ws.headers.host, "cdn.example.net");
        assert_eq!(tls.server_name, "de1.example.net");
        assert!(!tls.allow_insecure);
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
        assert_eq!(
            tls.alpn.as_deref(),
            Some(&["h2".to_string(), "http/1.1".to_string()][..])
        );
        assert!(stream.grpc_settings.is_none());
        assert!(stream.reality_settings.is_none());
    }

    #[test]
    fn test_json_key_names() {
        let value: Value = serde_json::from_str(&translate(WS_TLS).unwrap().to_json()).unwrap();

        assert_eq!(value["log"]["loglevel"], "warning");

        let inbound = &value["inbounds"][0];
        assert_eq!(inbound["tag"], "socks");
        assert_eq!(inbound["port"], 10808);
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["sniffing"]["destOverride"][1], "tls");
        assert_eq!(inbound["settings"]["auth"], "noauth");
        assert_eq!(inbound["settings"]["udp"], true);

        let proxy = &value["outbounds"][0];
        assert_eq!(proxy["protocol"], "vless");
        assert_eq!(proxy["settings"]["vnext"][0]["port"], 443);
        assert_eq!(proxy["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(proxy["streamSettings"]["wsSettings"]["headers"]["Host"], "cdn.example.net");
        assert_eq!(proxy["streamSettings"]["tlsSettings"]["allowInsecure"], false);

        assert_eq!(value["outbounds"][1], serde_json::json!({"tag": "direct", "protocol": "freedom"}));
        assert_eq!(value["outbounds"][2], serde_json::json!({"tag": "block", "protocol": "blackhole"}));
    }

    #[test]
    fn test_defaults() {
        let config = translate("vless://uid@example.org:8443").unwrap();
        let proxy = config.proxy_outbound().unwrap();
        let stream = proxy.stream_settings.as_ref().unwrap();
        let user = &proxy.settings.as_ref().unwrap().vnext[0].users[0];

        assert_eq!(stream.network, "tcp");
        assert_eq!(stream.security, "none");
        assert!(stream.tcp_settings.is_none());
        assert!(stream.tls_settings.is_none());
        assert_eq!(user.encryption, "none");
        assert_eq!(user.flow, None);
        assert_eq!(config.proxy_target(), Some(("example.org", 8443)));
    }

    #[test]
    fn test_ws_defaults() {
        let config = translate("vless://uid@ws.example:80?type=ws").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        let ws = stream.ws_settings.unwrap();

        assert_eq!(ws.path, "/");
        assert_eq!(ws.headers.host, "ws.example");
    }

    #[test]
    fn test_grpc() {
        let config = translate("vless://uid@g.example:443?type=grpc&serviceName=svc&mode=multi").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        let grpc = stream.grpc_settings.unwrap();
        assert_eq!(grpc.service_name, "svc");
        assert!(grpc.multi_mode);

        let config = translate("vless://uid@g.example:443?type=grpc&mode=gun").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        let grpc = stream.grpc_settings.unwrap();
        assert_eq!(grpc.service_name, "");
        assert!(!grpc.multi_mode);
    }

    #[test]
    fn test_tcp_header_type() {
        let config = translate("vless://uid@t.example:443?headerType=http").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        assert_eq!(stream.tcp_settings.unwrap().header.kind, "http");

        let config = translate("vless://uid@t.example:443?type=tcp&headerType=none").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        assert!(stream.tcp_settings.is_none());
    }

    #[test]
    fn test_reality() {
        let config = translate(
            "vless://uid@r.example:443?security=reality&sni=www.microsoft.com&pbk=PUBKEY&sid=ab12&fp=firefox",
        )
        .unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();
        let reality = stream.reality_settings.unwrap();

        assert_eq!(reality.server_name, "www.microsoft.com");
        assert_eq!(reality.public_key, "PUBKEY");
        assert_eq!(reality.short_id.as_deref(), Some("ab12"));
        assert_eq!(reality.fingerprint.as_deref(), Some("firefox"));
        assert!(stream.tls_settings.is_none());
    }

    #[test]
    fn test_allow_insecure_is_strict() {
        let on = translate("vless://u@h:1?security=tls&allowInsecure=true").unwrap();
        let odd = translate("vless://u@h:1?security=tls&allowInsecure=1").unwrap();

        let tls = |c: &EngineConfig| {
            c.proxy_outbound().unwrap().stream_settings.clone().unwrap().tls_settings.unwrap()
        };
        assert!(tls(&on).allow_insecure);
        assert!(!tls(&odd).allow_insecure);
    }

    #[test]
    fn test_unknown_transport_passes_through() {
        let config = translate("vless://u@h:1?type=h2&security=xtls").unwrap();
        let stream = config.proxy_outbound().unwrap().stream_settings.clone().unwrap();

        assert_eq!(stream.network, "h2");
        assert_eq!(stream.security, "xtls");
        assert!(stream.ws_settings.is_none() && stream.tcp_settings.is_none());
        assert!(stream.tls_settings.is_none() && stream.reality_settings.is_none());
    }

    #[test]
    fn test_validation_failures() {
        assert_eq!(
            translate("vmess://u@h:1"),
            Err(TranslateError::UnsupportedScheme("vmess".to_string()))
        );
        assert_eq!(translate(""), Err(TranslateError::Uri(UriError::Empty)));
        assert_eq!(translate("vless://h:1"), Err(TranslateError::Uri(UriError::MissingCredential)));
        assert_eq!(translate("vless://u@:443?type=ws"), Err(TranslateError::Uri(UriError::MissingHost)));
        assert_eq!(translate("vless://u@h"), Err(TranslateError::Uri(UriError::MissingPort)));
        assert!(matches!(
            translate("vless://u@h:0"),
            Err(TranslateError::Uri(UriError::InvalidPort(_)))
        ));
    }

    #[test]
    fn test_scheme_is_case_sensitive() {
        assert_eq!(
            translate("VLESS://uid@h:443"),
            Err(TranslateError::UnsupportedScheme("VLESS".to_string()))
        );
        assert_eq!(
            translate("Vless://uid@h:443"),
            Err(TranslateError::UnsupportedScheme("Vless".to_string()))
        );
        assert!(translate("vless://uid@h:443").is_ok());
    }

    #[test]
    fn test_custom_listener() {
        let translator = ConfigTranslator {
            port: 20808,
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let config = translator.translate("vless://u@h:1").unwrap();

        assert_eq!(config.socks_inbound().unwrap().port, 20808);
        assert_eq!(config.log.loglevel, "debug");
    }

    #[test]
    fn test_deterministic_output() {
        assert_eq!(translate(WS_TLS).unwrap().to_json(), translate(WS_TLS).unwrap().to_json());
    }
}
