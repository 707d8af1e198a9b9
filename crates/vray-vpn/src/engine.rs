//! Engine Seams
//!
//! The proxy-core engine, the native tunnel and the OS VPN facilities
//! are opaque collaborators. The orchestrator reaches them only
//! through these traits, and only the session controller drives their
//! lifecycle calls.

use crate::bridge::BridgeConfig;
use crate::config::InterfaceSettings;
use crate::translator::EngineConfig;
use async_trait::async_trait;
use std::os::fd::{OwnedFd, RawFd};

/// Proxy-core engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine environment init failed: {0}")]
    Init(String),

    #[error("Engine start failed: {0}")]
    Start(String),

    #[error("Engine stop failed: {0}")]
    Stop(String),

    #[error("Delay measurement failed: {0}")]
    Measure(String),
}

/// OS-level VPN facility errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Interface could not be established: {0}")]
    Establish(String),

    #[error("Traffic exclusion failed: {0}")]
    Exclude(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),
}

/// Proxy-core engine
///
/// Implements the proxy protocol and outbound forwarding. Lifecycle
/// calls must not race, so only one owner invokes them.
#[async_trait]
pub trait ProxyEngine: Send + Sync + 'static {
    /// Prepare the engine environment (asset paths etc.)
    ///
    /// Must be idempotent.
    fn init_env(&self) -> Result<(), EngineError>;

    /// Start forwarding with `config`
    async fn start(&self, config: &EngineConfig) -> Result<(), EngineError>;

    /// Stop forwarding
    async fn stop(&self) -> Result<(), EngineError>;

    /// Whether the engine loop is running
    fn is_running(&self) -> bool;

    /// Measure round-trip delay to `test_url` through `config`'s outbound
    ///
    /// Returns milliseconds. A negative value means the engine itself
    /// reported failure.
    async fn measure_delay(&self, config: &EngineConfig, test_url: &str) -> Result<i64, EngineError>;
}

/// Native tunnel bridging the virtual interface to the local SOCKS listener
pub trait NativeTunnel: Send + Sync + 'static {
    /// Run the bridge on `fd`; blocks until the tunnel exits
    ///
    /// Returns the tunnel's exit status.
    fn run(&self, config: &BridgeConfig, fd: RawFd) -> i32;

    /// Ask a running tunnel to exit
    fn quit(&self);

    /// Whether the tunnel loop is running
    fn is_running(&self) -> bool;

    /// Close a descriptor previously handed to `run`
    fn close_fd(&self, fd: RawFd);
}

/// OS VPN facilities
pub trait VpnPlatform: Send + Sync + 'static {
    /// Keep the orchestrator's own traffic out of the tunnel
    fn exclude_own_traffic(&self) -> Result<(), PlatformError>;

    /// Establish the virtual interface, returning its descriptor
    fn establish(&self, spec: &InterfaceSettings) -> Result<OwnedFd, PlatformError>;

    /// Whether a VPN-capable transport is currently observable
    fn vpn_transport_active(&self) -> bool;

    /// Acquire foreground/notification resources
    fn enter_foreground(&self) {}

    /// Release foreground/notification resources
    fn leave_foreground(&self) {}

    /// Terminate the hosting process
    ///
    /// Last-resort recovery after a watchdog-detected failure.
    fn terminate(&self) {
        std::process::exit(0)
    }
}
