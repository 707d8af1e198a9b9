//! Proxy-core engine backed by an external core binary.
//!
//! The core is started as a child process reading the translated JSON
//! configuration. Delay is measured by running a throwaway core on a
//! free loopback port and timing an HTTP GET of the test URL through
//! its SOCKS inbound.

use crate::delay::measure_through_socks;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vray_vpn::{EngineConfig, EngineError, ProxyEngine, INBOUND_TAG};

/// How long a throwaway core gets to open its inbound
const CORE_READY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ExternalCore {
    binary: PathBuf,
    work_dir: PathBuf,
    child: Mutex<Option<Child>>,
    running: AtomicBool,
}

impl ExternalCore {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            child: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.work_dir.join("vray-engine.json")
    }

    /// Write `config` to `path` and launch the core on it
    async fn spawn_core(&self, config: &EngineConfig, path: &Path) -> Result<Child, String> {
        tokio::fs::write(path, config.to_json_pretty())
            .await
            .map_err(|e| format!("write {}: {}", path.display(), e))?;

        Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("{}: {}", self.binary.display(), e))
    }
}

/// Reserve a free loopback port
async fn free_port() -> Result<u16, EngineError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|e| EngineError::Measure(e.to_string()))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| EngineError::Measure(e.to_string()))
}

/// Wait until something accepts on `addr`
async fn wait_for_listener(addr: SocketAddr) -> Result<(), EngineError> {
    let deadline = tokio::time::Instant::now() + CORE_READY_TIMEOUT;
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::Measure(format!("core did not open {}", addr)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Copy of `config` whose SOCKS inbound listens on `127.0.0.1:port`
fn with_inbound_port(config: &EngineConfig, port: u16) -> Result<EngineConfig, EngineError> {
    let mut config = config.clone();
    let inbound = config
        .inbounds
        .iter_mut()
        .find(|i| i.tag == INBOUND_TAG)
        .ok_or_else(|| EngineError::Measure("config has no socks inbound".into()))?;
    inbound.listen = Ipv4Addr::LOCALHOST.to_string();
    inbound.port = port;
    Ok(config)
}

#[async_trait]
impl ProxyEngine for ExternalCore {
    fn init_env(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| EngineError::Init(format!("{}: {}", self.work_dir.display(), e)))?;

        if self.binary.components().count() > 1 && !Path::new(&self.binary).exists() {
            return Err(EngineError::Init(format!("core binary not found: {}", self.binary.display())));
        }
        Ok(())
    }

    async fn start(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let mut child = self.child.lock().await;
        if child.is_some() {
            return Err(EngineError::Start("core already running".into()));
        }

        let spawned = self
            .spawn_core(config, &self.config_path())
            .await
            .map_err(EngineError::Start)?;

        info!("Proxy core started (pid {:?})", spawned.id());
        *child = Some(spawned);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = child.kill().await {
            warn!("Failed to kill proxy core: {}", e);
            return Err(EngineError::Stop(e.to_string()));
        }
        if let Err(e) = tokio::fs::remove_file(self.config_path()).await {
            debug!("Engine config not removed: {}", e);
        }
        info!("Proxy core stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn measure_delay(&self, config: &EngineConfig, test_url: &str) -> Result<i64, EngineError> {
        let port = free_port().await?;
        let probe_config = with_inbound_port(config, port)?;
        let path = self.work_dir.join(format!("vray-delay-{}.json", port));

        let mut core = self.spawn_core(&probe_config, &path).await.map_err(EngineError::Measure)?;

        let proxy = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let measured = match wait_for_listener(proxy).await {
            Ok(()) => measure_through_socks(proxy, test_url)
                .await
                .map_err(|e| EngineError::Measure(e.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = core.kill().await {
            debug!("Throwaway core already gone: {}", e);
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Delay config not removed: {}", e);
        }

        let elapsed = measured?;
        Ok(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
    }
}
