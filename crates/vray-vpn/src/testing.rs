//! In-process fakes for the opaque engine, native tunnel and platform.

use crate::bridge::BridgeConfig;
use crate::config::InterfaceSettings;
use crate::engine::{EngineError, NativeTunnel, PlatformError, ProxyEngine, VpnPlatform};
use crate::translator::EngineConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// What the fake engine does when asked to measure a host
#[derive(Debug, Clone, Copy)]
pub enum DelayScript {
    Millis(i64),
    Error,
    Hang,
}

#[derive(Default)]
pub struct FakeEngine {
    pub init_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub measure_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    /// Extra time spent inside `start`
    pub start_delay_ms: AtomicU64,
    running: AtomicBool,
    scripts: Mutex<HashMap<String, DelayScript>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the delay reported for a proxy host
    pub fn script(&self, host: &str, script: DelayScript) {
        self.scripts.lock().unwrap().insert(host.to_string(), script);
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyEngine for FakeEngine {
    fn init_env(&self) -> Result<(), EngineError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _config: &EngineConfig) -> Result<(), EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers interleave with a start in flight
        let extra = self.start_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10 + extra)).await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("scripted failure".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn measure_delay(&self, config: &EngineConfig, _test_url: &str) -> Result<i64, EngineError> {
        self.measure_calls.fetch_add(1, Ordering::SeqCst);
        let host = config.proxy_target().map(|(h, _)| h.to_string()).unwrap_or_default();
        let script = self.scripts.lock().unwrap().get(&host).copied();

        match script {
            Some(DelayScript::Millis(ms)) => {
                tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
                Ok(ms)
            }
            Some(DelayScript::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
            Some(DelayScript::Error) | None => Err(EngineError::Measure(format!("unreachable: {}", host))),
        }
    }
}

#[derive(Default)]
pub struct FakeTunnel {
    pub run_calls: AtomicUsize,
    pub quit_calls: AtomicUsize,
    pub closed_fds: Mutex<Vec<RawFd>>,
    /// Keep running this long after `quit`
    pub linger: Mutex<Option<Duration>>,
    running: AtomicBool,
    quit: AtomicBool,
}

impl FakeTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quits(&self) -> usize {
        self.quit_calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<RawFd> {
        self.closed_fds.lock().unwrap().clone()
    }
}

impl NativeTunnel for FakeTunnel {
    fn run(&self, _config: &BridgeConfig, _fd: RawFd) -> i32 {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        while !self.quit.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        if let Some(linger) = *self.linger.lock().unwrap() {
            thread::sleep(linger);
        }

        self.running.store(false, Ordering::SeqCst);
        0
    }

    fn quit(&self) {
        self.quit_calls.fetch_add(1, Ordering::SeqCst);
        self.quit.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close_fd(&self, fd: RawFd) {
        self.closed_fds.lock().unwrap().push(fd);
        // SAFETY: the session hands over a detached descriptor exactly once
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

pub struct FakePlatform {
    pub establish_calls: AtomicUsize,
    pub exclude_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub foreground_enter: AtomicUsize,
    pub foreground_leave: AtomicUsize,
    pub fail_establish: AtomicBool,
    pub fail_exclude: AtomicBool,
    pub vpn_active: AtomicBool,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            establish_calls: AtomicUsize::new(0),
            exclude_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            foreground_enter: AtomicUsize::new(0),
            foreground_leave: AtomicUsize::new(0),
            fail_establish: AtomicBool::new(false),
            fail_exclude: AtomicBool::new(false),
            vpn_active: AtomicBool::new(false),
        }
    }

    pub fn terminations(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    /// Simulate the OS losing the VPN transport
    pub fn drop_transport(&self) {
        self.vpn_active.store(false, Ordering::SeqCst);
    }
}

impl VpnPlatform for FakePlatform {
    fn exclude_own_traffic(&self) -> Result<(), PlatformError> {
        self.exclude_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exclude.load(Ordering::SeqCst) {
            return Err(PlatformError::Exclude("not permitted".into()));
        }
        Ok(())
    }

    fn establish(&self, _spec: &InterfaceSettings) -> Result<OwnedFd, PlatformError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_establish.load(Ordering::SeqCst) {
            return Err(PlatformError::Establish("permission revoked".into()));
        }
        let file = std::fs::File::open("/dev/null").map_err(|e| PlatformError::Establish(e.to_string()))?;
        self.vpn_active.store(true, Ordering::SeqCst);
        Ok(OwnedFd::from(file))
    }

    fn vpn_transport_active(&self) -> bool {
        self.vpn_active.load(Ordering::SeqCst)
    }

    fn enter_foreground(&self) {
        self.foreground_enter.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_foreground(&self) {
        self.foreground_leave.fetch_add(1, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
