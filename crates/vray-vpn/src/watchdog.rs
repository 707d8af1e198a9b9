//! Transport Watchdog
//!
//! Periodically checks that the OS still reports a VPN transport while
//! a session is running. When the transport disappears the session is
//! force-killed exactly once and the watchdog exits.

use crate::engine::VpnPlatform;
use crate::session::WeakSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Watchdog configuration
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Check period
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// Handle to a running watchdog
pub struct WatchdogHandle {
    cancel: CancellationToken,
}

impl WatchdogHandle {
    /// Stop checking; safe to call from within the watchdog itself
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Start the watchdog for `session`
pub(crate) fn spawn_watchdog(
    config: WatchdogConfig,
    platform: Arc<dyn VpnPlatform>,
    session: WeakSession,
) -> WatchdogHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        // interval() rejects a zero period
        let period = config.interval.max(Duration::from_millis(1));
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Watchdog cancelled");
                    break;
                }
                _ = ticks.tick() => {}
            }

            if platform.vpn_transport_active() {
                continue;
            }

            error!("VPN transport lost, forcing session down");
            match session.upgrade() {
                Some(controller) => {
                    if !controller.force_kill().await {
                        debug!("Session already leaving Running, watchdog standing down");
                    }
                }
                None => debug!("Session gone, watchdog exiting"),
            }
            break;
        }
    });

    WatchdogHandle { cancel }
}

#[cfg(test)]
mod tests {
    use crate::config::VpnSettings;
    use crate::events::SessionEvent;
    use crate::session::{SessionController, SessionState, StopOutcome};
    use crate::testing::{eventually, FakeEngine, FakePlatform, FakeTunnel};
    use crate::translator::translate;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller(platform: Arc<FakePlatform>) -> (Arc<FakeEngine>, SessionController) {
        let mut settings = VpnSettings::default();
        settings.session.watchdog_interval_ms = 20;
        settings.session.stop_timeout_ms = 500;

        let engine = Arc::new(FakeEngine::new());
        let session = SessionController::new(engine.clone(), Arc::new(FakeTunnel::new()), platform, settings);
        (engine, session)
    }

    fn config() -> crate::translator::EngineConfig {
        translate("vless://uid@example.net:443").unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_loss_forces_kill_once() {
        let platform = Arc::new(FakePlatform::new());
        let (engine, session) = controller(platform.clone());
        let events = session.subscribe();

        session.start(&config()).await.unwrap();
        platform.drop_transport();

        assert!(eventually(Duration::from_secs(2), || platform.terminations() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(platform.terminations(), 1);
        assert_eq!(engine.stops(), 1);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            events.try_iter().filter(|e| *e == SessionEvent::ForceKilled).count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_kill_after_clean_stop() {
        let platform = Arc::new(FakePlatform::new());
        let (_engine, session) = controller(platform.clone());

        session.start(&config()).await.unwrap();
        session.stop().await;
        platform.drop_transport();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(platform.terminations(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_healthy_transport_keeps_running() {
        let platform = Arc::new(FakePlatform::new());
        let (_engine, session) = controller(platform.clone());

        session.start(&config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(platform.terminations(), 0);
        session.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_racing_force_kill_tears_down_once() {
        for kill_first in [false, true] {
            let platform = Arc::new(FakePlatform::new());
            let (engine, session) = controller(platform.clone());
            session.start(&config()).await.unwrap();

            let (outcome, killed) = if kill_first {
                let (killed, outcome) = tokio::join!(session.force_kill(), session.stop());
                (outcome, killed)
            } else {
                tokio::join!(session.stop(), session.force_kill())
            };

            assert_eq!(engine.stops(), 1);
            assert_eq!(session.state(), SessionState::Idle);
            assert_eq!(platform.terminations(), usize::from(killed));
            assert_ne!(outcome == StopOutcome::Stopped, killed);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_and_force_kill_on_separate_tasks() {
        let platform = Arc::new(FakePlatform::new());
        let (engine, session) = controller(platform.clone());
        session.start(&config()).await.unwrap();

        let stopper = session.clone();
        let killer = session.clone();
        let stop = tokio::spawn(async move { stopper.stop().await });
        let kill = tokio::spawn(async move { killer.force_kill().await });
        let outcome = stop.await.unwrap();
        let killed = kill.await.unwrap();

        assert_eq!(engine.stops(), 1);
        assert!(platform.terminations() <= 1);
        assert_eq!(session.state(), SessionState::Idle);
        assert_ne!(outcome == StopOutcome::Stopped, killed);
    }
}
