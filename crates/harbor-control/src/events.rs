//! Outbound events for the notification layer.

use harbor_core::AppName;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// Events published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// The set of installed apps changed.
    AppsChanged,
    /// An install, uninstall or reinstall task failed.
    InstallationFailed {
        /// The app the task was for.
        app: AppName,
        /// Why it failed.
        reason: String,
    },
}

/// Broadcast channel for [`AppEvent`]s.
///
/// Publishing never blocks. Subscribers that fall behind lose the oldest
/// events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to current subscribers.
    pub fn emit(&self, event: AppEvent) {
        tracing::debug!(event = ?event, "Publishing event");
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}
