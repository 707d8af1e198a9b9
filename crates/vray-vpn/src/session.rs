//! Tunnel Session Controller
//!
//! Owns the single process-wide VPN session and drives the proxy-core
//! engine, the virtual interface and the native tunnel through it.
//!
//! # State Machine
//!
//! ```text
//!          start()                 bring-up ok
//!   Idle ──────────▶ Starting ─────────────────▶ Running
//!    ▲                  │  │                        │
//!    │     bring-up err │  │ stop()                 │ stop() / watchdog
//!    │◀─────────────────┘  ▼                        ▼
//!    │◀──────────────── Stopping ◀──────────────────┘
//!         teardown
//! ```
//!
//! Transitions are serialized by a mutex-protected phase that is never
//! held across an await, so callers are never blocked: a request that
//! does not fit the current state is rejected immediately.
//!
//! # Resource Discipline
//!
//! The interface descriptor belongs to the controller. A duplicate is
//! detached and handed to the native tunnel. Both are closed on every
//! rollback and shutdown path.

use crate::bridge::BridgeConfig;
use crate::config::VpnSettings;
use crate::engine::{EngineError, NativeTunnel, PlatformError, ProxyEngine, VpnPlatform};
use crate::events::{EventBus, SessionEvent};
use crate::translator::EngineConfig;
use crate::watchdog::{spawn_watchdog, WatchdogConfig, WatchdogHandle};
use crossbeam_channel::Receiver;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session state, the single source of truth for tunnel activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No tunnel
    Idle,
    /// Bring-up in progress
    Starting,
    /// Tunnel is up and supervised
    Running,
    /// Teardown in progress
    Stopping,
}

impl SessionState {
    /// Check if a session exists
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Check if the tunnel is usable
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already active")]
    AlreadyActive,

    #[error("Engine start error: {0}")]
    EngineStart(#[source] EngineError),

    #[error("Interface setup error: {0}")]
    InterfaceSetup(#[source] PlatformError),

    #[error("Tunnel launch error: {0}")]
    TunnelLaunch(String),

    #[error("Start aborted by stop request")]
    Aborted,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call ran the teardown
    Stopped,
    /// A start was in flight; it rolls itself back
    AbortingStart,
    /// Another teardown is already running
    AlreadyStopping,
    /// Nothing to stop
    NotActive,
}

/// Commands accepted from the foreground
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Start(EngineConfig),
    Stop,
}

/// Live resources of a running session, released together
struct TunnelHandle {
    /// Interface descriptor owned by the controller
    interface: OwnedFd,
    /// Duplicate handed to the native tunnel
    detached_fd: RawFd,
    tunnel_task: JoinHandle<()>,
    tunnel_cancel: CancellationToken,
    watchdog: WatchdogHandle,
}

enum Phase {
    Idle,
    Starting,
    Running(TunnelHandle),
    Stopping,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Starting => SessionState::Starting,
            Phase::Running(_) => SessionState::Running,
            Phase::Stopping => SessionState::Stopping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Bounded join of the tunnel task
    Graceful,
    /// No waiting, the process is about to go away
    Forced,
}

struct Shared {
    phase: Mutex<Phase>,
    engine: Arc<dyn ProxyEngine>,
    tunnel: Arc<dyn NativeTunnel>,
    platform: Arc<dyn VpnPlatform>,
    settings: VpnSettings,
    events: EventBus<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

/// Engines driven by a non-Idle session, keyed by address
static CLAIMED_ENGINES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

impl Shared {
    fn engine_key(&self) -> usize {
        Arc::as_ptr(&self.engine).cast::<()>() as usize
    }

    /// Take exclusive lifecycle ownership of the engine
    fn claim_engine(&self) -> bool {
        let key = self.engine_key();
        let mut claimed = CLAIMED_ENGINES.lock().unwrap_or_else(|e| e.into_inner());
        if claimed.contains(&key) {
            return false;
        }
        claimed.push(key);
        true
    }

    fn release_engine(&self) {
        let key = self.engine_key();
        CLAIMED_ENGINES
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k| *k != key);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last owner gone with a live tunnel: release what can be released synchronously
        let phase = std::mem::replace(
            self.phase.get_mut().unwrap_or_else(|e| e.into_inner()),
            Phase::Idle,
        );
        if !matches!(phase, Phase::Idle) {
            self.release_engine();
        }
        if let Phase::Running(handle) = phase {
            warn!("Session controller dropped while running, releasing tunnel");
            handle.watchdog.cancel();
            handle.tunnel_cancel.cancel();
            self.tunnel.quit();
            self.tunnel.close_fd(handle.detached_fd);
            self.platform.leave_foreground();
        }
    }
}

/// Session controller
///
/// Cheap to clone; all clones drive the same session. Build one
/// controller per engine: a second controller over the same engine
/// is refused with `AlreadyActive` while the first is not Idle.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

/// Non-owning reference held by the watchdog
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<Shared>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<SessionController> {
        self.0.upgrade().map(|shared| SessionController { shared })
    }
}

impl SessionController {
    /// Create a controller over the given collaborators
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        tunnel: Arc<dyn NativeTunnel>,
        platform: Arc<dyn VpnPlatform>,
        settings: VpnSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Self {
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                engine,
                tunnel,
                platform,
                settings,
                events: EventBus::new(),
                state_tx,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    /// Check if a session exists
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Watch state changes
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Settings this controller was built with
    pub fn settings(&self) -> &VpnSettings {
        &self.shared.settings
    }

    /// Submit a command without waiting for it
    pub fn submit(&self, command: SessionCommand) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            match command {
                SessionCommand::Start(config) => {
                    if let Err(e) = session.start(&config).await {
                        debug!("Start command finished: {}", e);
                    }
                }
                SessionCommand::Stop => {
                    let outcome = session.stop().await;
                    debug!("Stop command finished: {:?}", outcome);
                }
            }
        })
    }

    /// Start a session with `config`
    ///
    /// 1. Initializes and starts the proxy-core engine
    /// 2. Establishes the virtual interface
    /// 3. Detaches a descriptor and launches the native tunnel
    /// 4. Starts the watchdog
    ///
    /// Any failure releases everything acquired so far and returns to Idle.
    ///
    /// Bring-up runs on its own task: dropping the returned future does
    /// not cancel it, so the session always settles in Running or Idle.
    pub async fn start(&self, config: &EngineConfig) -> Result<(), SessionError> {
        let session = self.clone();
        let config = config.clone();

        match tokio::spawn(async move { session.run_start(&config).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!("Start task failed: {}", e);
                let reset = {
                    let mut phase = self.lock();
                    let from = phase.state();
                    if matches!(*phase, Phase::Starting | Phase::Stopping) {
                        *phase = Phase::Idle;
                        self.shared.release_engine();
                        Some(from)
                    } else {
                        None
                    }
                };
                if let Some(from) = reset {
                    self.notify(from, SessionState::Idle);
                }
                Err(SessionError::TunnelLaunch(e.to_string()))
            }
        }
    }

    async fn run_start(&self, config: &EngineConfig) -> Result<(), SessionError> {
        {
            let mut phase = self.lock();
            if !matches!(*phase, Phase::Idle) {
                info!("Start ignored, session is {}", phase.state());
                return Err(SessionError::AlreadyActive);
            }
            if !self.shared.claim_engine() {
                info!("Start ignored, engine is driven by another session");
                return Err(SessionError::AlreadyActive);
            }
            *phase = Phase::Starting;
        }
        self.notify(SessionState::Idle, SessionState::Starting);
        info!("Starting VPN session");

        let handle = match self.bring_up(config).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("VPN session start failed: {}", e);
                self.shared.events.publish(SessionEvent::StartFailed {
                    reason: e.to_string(),
                });
                let from = self.set_idle();
                self.notify(from, SessionState::Idle);
                return Err(e);
            }
        };

        // A stop may have arrived while we were bringing the tunnel up
        let aborted = {
            let mut phase = self.lock();
            if matches!(*phase, Phase::Starting) {
                *phase = Phase::Running(handle);
                None
            } else {
                Some(handle)
            }
        };

        match aborted {
            None => {
                self.notify(SessionState::Starting, SessionState::Running);
                info!("VPN session running");
                Ok(())
            }
            Some(handle) => {
                warn!("Stop requested during start, tearing down");
                self.teardown(handle, Teardown::Graceful).await;
                let from = self.set_idle();
                self.notify(from, SessionState::Idle);
                Err(SessionError::Aborted)
            }
        }
    }

    /// Stop the session
    ///
    /// Only one teardown runs even under concurrent calls; the others
    /// return immediately.
    pub async fn stop(&self) -> StopOutcome {
        let handle = {
            let mut phase = self.lock();
            match std::mem::replace(&mut *phase, Phase::Stopping) {
                Phase::Running(handle) => Some(handle),
                Phase::Starting => None,
                Phase::Stopping => {
                    debug!("Stop already in progress");
                    return StopOutcome::AlreadyStopping;
                }
                Phase::Idle => {
                    *phase = Phase::Idle;
                    debug!("Stop ignored, no active session");
                    return StopOutcome::NotActive;
                }
            }
        };

        let Some(handle) = handle else {
            // The in-flight start sees Stopping and rolls itself back
            info!("Stop requested while starting");
            self.notify(SessionState::Starting, SessionState::Stopping);
            return StopOutcome::AbortingStart;
        };

        self.notify(SessionState::Running, SessionState::Stopping);
        info!("Stopping VPN session");

        self.teardown(handle, Teardown::Graceful).await;

        let from = self.set_idle();
        self.notify(from, SessionState::Idle);
        info!("VPN session stopped");
        StopOutcome::Stopped
    }

    /// Tear down without waiting and terminate the process
    ///
    /// Watchdog-only. Returns false when the session was not Running,
    /// so a concurrent stop and a watchdog trip never overlap.
    pub(crate) async fn force_kill(&self) -> bool {
        let handle = {
            let mut phase = self.lock();
            match std::mem::replace(&mut *phase, Phase::Stopping) {
                Phase::Running(handle) => handle,
                other => {
                    *phase = other;
                    return false;
                }
            }
        };

        warn!("Force killing VPN session");
        self.notify(SessionState::Running, SessionState::Stopping);

        self.teardown(handle, Teardown::Forced).await;

        let from = self.set_idle();
        self.notify(from, SessionState::Idle);
        self.shared.events.publish(SessionEvent::ForceKilled);

        error!("Native resources may be unrecoverable, terminating process");
        self.shared.platform.terminate();
        true
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.shared))
    }

    async fn bring_up(&self, config: &EngineConfig) -> Result<TunnelHandle, SessionError> {
        let shared = &self.shared;
        let settings = &shared.settings;

        shared.platform.enter_foreground();

        // Step 1: proxy-core engine
        let engine_started = match shared.engine.init_env() {
            Ok(()) => shared.engine.start(config).await,
            Err(e) => Err(e),
        };
        if let Err(e) = engine_started {
            shared.platform.leave_foreground();
            return Err(SessionError::EngineStart(e));
        }
        debug!("Proxy-core engine started");

        // Step 2: virtual interface
        if settings.interface.exclude_self {
            if let Err(e) = shared.platform.exclude_own_traffic() {
                warn!("Could not exclude own traffic from tunnel: {}", e);
            }
        }

        let interface = match shared.platform.establish(&settings.interface) {
            Ok(fd) => fd,
            Err(e) => {
                self.rollback_engine().await;
                return Err(SessionError::InterfaceSetup(e));
            }
        };
        debug!(
            "Virtual interface established ({}/{}, mtu {})",
            settings.interface.address, settings.interface.prefix_len, settings.interface.mtu
        );

        // Step 3: detached descriptor and native tunnel
        let detached_fd = match interface.try_clone() {
            Ok(dup) => dup.into_raw_fd(),
            Err(e) => {
                drop(interface);
                self.rollback_engine().await;
                return Err(SessionError::TunnelLaunch(format!("descriptor detach failed: {}", e)));
            }
        };

        let bridge = BridgeConfig::from_settings(settings);
        let tunnel_cancel = CancellationToken::new();
        let tunnel_task = spawn_tunnel(shared.tunnel.clone(), bridge, detached_fd, tunnel_cancel.clone());

        // Step 4: watchdog
        let watchdog = spawn_watchdog(
            WatchdogConfig {
                interval: settings.session.watchdog_interval(),
            },
            shared.platform.clone(),
            self.downgrade(),
        );

        Ok(TunnelHandle {
            interface,
            detached_fd,
            tunnel_task,
            tunnel_cancel,
            watchdog,
        })
    }

    async fn rollback_engine(&self) {
        warn!("Rolling back proxy-core engine");
        if let Err(e) = self.shared.engine.stop().await {
            error!("Engine rollback failed: {}", e);
        }
        self.shared.platform.leave_foreground();
    }

    async fn teardown(&self, handle: TunnelHandle, mode: Teardown) {
        let shared = &self.shared;
        let TunnelHandle {
            interface,
            detached_fd,
            mut tunnel_task,
            tunnel_cancel,
            watchdog,
        } = handle;

        watchdog.cancel();

        // Step 1: signal the native tunnel, close its descriptor
        shared.tunnel.quit();
        shared.tunnel.close_fd(detached_fd);

        // Step 2: cancel the tunnel task
        tunnel_cancel.cancel();
        match mode {
            Teardown::Graceful => {
                let limit = shared.settings.session.stop_timeout();
                match tokio::time::timeout(limit, &mut tunnel_task).await {
                    Ok(_) => debug!("Tunnel task joined"),
                    Err(_) => {
                        warn!("Tunnel task did not join within {:?}, continuing", limit);
                        tunnel_task.abort();
                    }
                }
            }
            Teardown::Forced => tunnel_task.abort(),
        }

        // Step 3: proxy-core engine
        if let Err(e) = shared.engine.stop().await {
            error!("Engine stop failed: {}", e);
        }

        // Step 4: foreground resources
        shared.platform.leave_foreground();

        // Step 5: virtual interface
        drop(interface);
        debug!("Virtual interface closed");
    }

    /// Move to Idle, returning the state we left
    fn set_idle(&self) -> SessionState {
        let mut phase = self.lock();
        let from = phase.state();
        *phase = Phase::Idle;
        self.shared.release_engine();
        from
    }

    fn notify(&self, from: SessionState, to: SessionState) {
        debug!("Session state: {} -> {}", from, to);
        self.shared.state_tx.send_replace(to);
        self.shared.events.publish(SessionEvent::StateChanged { from, to });
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.shared.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run the blocking native tunnel in the background
fn spawn_tunnel(
    tunnel: Arc<dyn NativeTunnel>,
    bridge: BridgeConfig,
    fd: RawFd,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let run = tokio::task::spawn_blocking(move || tunnel.run(&bridge, fd));
        match run.await {
            Ok(status) if cancel.is_cancelled() => debug!("Native tunnel exited with status {}", status),
            Ok(status) => warn!("Native tunnel exited on its own with status {}", status),
            Err(e) => error!("Native tunnel task failed: {}", e),
        }
    })
}
