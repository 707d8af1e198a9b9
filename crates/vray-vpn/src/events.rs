//! Typed Event Bus
//!
//! Fan-out of session and probe events to presentation layers. Each
//! subscriber owns an unbounded channel; subscribers that hang up are
//! dropped on the next publish.

use crate::probe::Latency;
use crate::session::SessionState;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Mutex;
use tracing::trace;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Every state transition
    StateChanged { from: SessionState, to: SessionState },
    /// A start attempt was rolled back
    StartFailed { reason: String },
    /// The watchdog tore the session down
    ForceKilled,
}

/// Probe batch notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// One candidate finished probing
    ResultUpdated {
        index: usize,
        uri: String,
        latency: Latency,
    },
    /// Every probe in the batch completed
    BatchFinished { probed: usize },
}

/// Broadcast bus
pub struct EventBus<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber
    pub fn publish(&self, event: T) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!("Event delivered to {} subscribers", subscribers.len());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<T>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
