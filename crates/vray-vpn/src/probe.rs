//! Server Probe
//!
//! Measures every candidate concurrently through the proxy-core engine.
//! Per-server failures are absorbed into the result map and never fail
//! the batch.

use crate::config::VpnSettings;
use crate::engine::ProxyEngine;
use crate::events::{EventBus, ProbeEvent};
use crate::server::ServerDescriptor;
use crate::translator::ConfigTranslator;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Sentinel recorded when the probe timed out or the engine failed
pub const PROBE_FAILED: i64 = -1;

/// Sentinel recorded when the connection URI could not be translated
pub const UNTRANSLATABLE: i64 = -2;

/// Outcome of probing one connection URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum Latency {
    /// Round-trip time in milliseconds
    Millis(u64),
    /// Timeout or transport error
    Failed,
    /// Malformed connection URI
    Untranslatable,
}

impl Latency {
    /// Integer form, with negative sentinels for failures
    pub fn as_sentinel(&self) -> i64 {
        match self {
            Latency::Millis(ms) => i64::try_from(*ms).unwrap_or(i64::MAX),
            Latency::Failed => PROBE_FAILED,
            Latency::Untranslatable => UNTRANSLATABLE,
        }
    }

    pub fn from_sentinel(value: i64) -> Self {
        match value {
            UNTRANSLATABLE => Latency::Untranslatable,
            v if v < 0 => Latency::Failed,
            v => Latency::Millis(v as u64),
        }
    }

    /// Eligible for selection: strictly positive round-trip time
    pub fn is_usable(&self) -> bool {
        matches!(self, Latency::Millis(ms) if *ms > 0)
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            Latency::Millis(ms) => Some(*ms),
            _ => None,
        }
    }
}

impl From<Latency> for i64 {
    fn from(latency: Latency) -> Self {
        latency.as_sentinel()
    }
}

impl From<i64> for Latency {
    fn from(value: i64) -> Self {
        Latency::from_sentinel(value)
    }
}

impl std::fmt::Display for Latency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Latency::Millis(ms) => write!(f, "{} ms", ms),
            Latency::Failed => f.write_str("unreachable"),
            Latency::Untranslatable => f.write_str("invalid config"),
        }
    }
}

/// Probe results keyed by connection URI
pub type ProbeResults = HashMap<String, Latency>;

/// Concurrent latency prober
pub struct ServerProbe {
    engine: Arc<dyn ProxyEngine>,
    translator: ConfigTranslator,
    test_url: String,
    timeout: Duration,
    events: EventBus<ProbeEvent>,
}

impl ServerProbe {
    pub fn new(engine: Arc<dyn ProxyEngine>, settings: &VpnSettings) -> Self {
        Self {
            engine,
            translator: ConfigTranslator::from_settings(settings),
            test_url: settings.probe.test_url.clone(),
            timeout: settings.probe.timeout(),
            events: EventBus::new(),
        }
    }

    /// Override the per-probe timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Subscribe to per-item and batch notifications
    pub fn subscribe(&self) -> Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Probe every descriptor concurrently and wait for all of them
    ///
    /// The result has exactly one key per distinct connection URI. When
    /// a URI appears more than once, the outcome for its last occurrence
    /// in `descriptors` is kept.
    pub async fn probe_all(&self, descriptors: &[ServerDescriptor]) -> ProbeResults {
        info!("Probing {} servers", descriptors.len());

        let mut tasks = JoinSet::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            let engine = self.engine.clone();
            let translator = self.translator.clone();
            let test_url = self.test_url.clone();
            let timeout = self.timeout;
            let uri = descriptor.connection_uri.clone();

            tasks.spawn(async move {
                let latency = measure(engine.as_ref(), &translator, &uri, &test_url, timeout).await;
                (index, uri, latency)
            });
        }

        let mut outcomes: Vec<Option<Latency>> = vec![None; descriptors.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, uri, latency)) => {
                    debug!("Probe {} finished: {}", uri, latency);
                    outcomes[index] = Some(latency);
                    self.events.publish(ProbeEvent::ResultUpdated { index, uri, latency });
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        // Apply in input order so duplicates resolve to the last occurrence
        let mut results = ProbeResults::with_capacity(descriptors.len());
        for (descriptor, outcome) in descriptors.iter().zip(outcomes) {
            results.insert(descriptor.connection_uri.clone(), outcome.unwrap_or(Latency::Failed));
        }

        self.events.publish(ProbeEvent::BatchFinished {
            probed: descriptors.len(),
        });
        info!(
            "Probe batch finished: {}/{} usable",
            results.values().filter(|l| l.is_usable()).count(),
            results.len()
        );
        results
    }

    /// Probe a single connection URI
    pub async fn probe_one(&self, uri: &str) -> Latency {
        measure(self.engine.as_ref(), &self.translator, uri, &self.test_url, self.timeout).await
    }
}

async fn measure(
    engine: &dyn ProxyEngine,
    translator: &ConfigTranslator,
    uri: &str,
    test_url: &str,
    timeout: Duration,
) -> Latency {
    let config = match translator.translate(uri) {
        Ok(config) => config,
        Err(e) => {
            debug!("Skipping untranslatable URI: {}", e);
            return Latency::Untranslatable;
        }
    };

    match tokio::time::timeout(timeout, engine.measure_delay(&config, test_url)).await {
        Ok(Ok(ms)) if ms >= 0 => Latency::Millis(ms as u64),
        Ok(Ok(ms)) => {
            debug!("Engine reported delay {}", ms);
            Latency::Failed
        }
        Ok(Err(e)) => {
            debug!("{}", e);
            Latency::Failed
        }
        Err(_) => {
            debug!("Probe timed out after {:?}", timeout);
            Latency::Failed
        }
    }
}
