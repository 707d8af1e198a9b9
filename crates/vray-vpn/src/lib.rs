//! vray VPN - Client-Side Tunnel Session Orchestrator
//!
//! Turns a list of proxy servers into a supervised system-wide tunnel:
//! probes every candidate through the proxy-core engine, picks the
//! fastest, translates its connection URI into an engine configuration
//! and drives the session that bridges a virtual interface into it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ ServerList   │──▶│ ServerProbe │──▶│   select()   │
//! └──────────────┘   └──────┬──────┘   └──────┬───────┘
//!                           │ translate       │ chosen server
//!                           ▼                 ▼
//!                    ┌──────────────────────────────┐
//!                    │      ConfigTranslator        │
//!                    └──────────────┬───────────────┘
//!                                   │ EngineConfig
//!                                   ▼
//! ┌──────────────┐   ┌──────────────────────────────┐
//! │   Watchdog   │──▶│      SessionController       │
//! └──────────────┘   │ engine ─ interface ─ tunnel  │
//!   force_kill()     └──────────────────────────────┘
//! ```
//!
//! The proxy-core engine, the native tunnel and the OS VPN facilities
//! are reached only through the [`ProxyEngine`], [`NativeTunnel`] and
//! [`VpnPlatform`] traits.

mod bridge;
mod config;
mod engine;
mod events;
mod probe;
mod selector;
mod server;
mod session;
mod translator;
mod uri;
mod watchdog;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeConfig, MiscSection, Socks5Section, TunnelSection, UdpMode};
pub use config::{
    ConfigError, InboundSettings, InterfaceSettings, ProbeSettings, SessionSettings, TunnelSettings,
    VpnSettings,
};
pub use engine::{EngineError, NativeTunnel, PlatformError, ProxyEngine, VpnPlatform};
pub use events::{EventBus, ProbeEvent, SessionEvent};
pub use probe::{Latency, ProbeResults, ServerProbe, PROBE_FAILED, UNTRANSLATABLE};
pub use selector::{select, usable_servers, LatencyGrade};
pub use server::{ServerDescriptor, ServerList};
pub use session::{SessionCommand, SessionController, SessionError, SessionState, StopOutcome};
pub use translator::{
    translate, ConfigTranslator, EngineConfig, Inbound, Outbound, StreamSettings, TranslateError,
    INBOUND_TAG, PROXY_PROTOCOL, PROXY_SCHEME, PROXY_TAG,
};
pub use uri::{ConnectionUri, UriError, DEFAULT_REMARKS};
pub use watchdog::{WatchdogConfig, WatchdogHandle};
