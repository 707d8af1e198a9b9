//! Server selection over probe results.

use crate::probe::{Latency, ProbeResults};
use crate::server::ServerDescriptor;
use serde::{Deserialize, Serialize};

/// Coarse latency quality shown next to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyGrade {
    /// Below 300 ms
    Good,
    /// 300 to 499 ms
    Fair,
    /// 500 ms and above
    Poor,
    /// Not usable
    Unreachable,
}

impl LatencyGrade {
    pub fn of(latency: Latency) -> Self {
        match latency {
            Latency::Millis(ms) if ms > 0 && ms < 300 => LatencyGrade::Good,
            Latency::Millis(ms) if ms > 0 && ms < 500 => LatencyGrade::Fair,
            Latency::Millis(ms) if ms > 0 => LatencyGrade::Poor,
            _ => LatencyGrade::Unreachable,
        }
    }
}

impl From<Latency> for LatencyGrade {
    fn from(latency: Latency) -> Self {
        Self::of(latency)
    }
}

/// Pick the server to connect to
///
/// The fastest server with a strictly positive latency wins, earliest
/// in `descriptors` on ties. With no usable result the first descriptor
/// is returned. An empty list selects nothing.
pub fn select<'a>(descriptors: &'a [ServerDescriptor], results: &ProbeResults) -> Option<&'a ServerDescriptor> {
    let mut best: Option<(&ServerDescriptor, u64)> = None;

    for descriptor in descriptors {
        let Some(latency) = results.get(&descriptor.connection_uri) else {
            continue;
        };
        if !latency.is_usable() {
            continue;
        }
        let Some(ms) = latency.millis() else {
            continue;
        };
        if best.is_none_or(|(_, current)| ms < current) {
            best = Some((descriptor, ms));
        }
    }

    best.map(|(descriptor, _)| descriptor).or_else(|| descriptors.first())
}

/// Servers worth listing: everything except confirmed probe failures
///
/// Untranslatable and unprobed entries are kept so they stay visible.
pub fn usable_servers<'a>(descriptors: &'a [ServerDescriptor], results: &ProbeResults) -> Vec<&'a ServerDescriptor> {
    descriptors
        .iter()
        .filter(|d| results.get(&d.connection_uri) != Some(&Latency::Failed))
        .collect()
}
