//! Connectivity tracking and engine state publication
//!
//! The platform's interface signal alone is not trusted: an "online" event is
//! confirmed with a bounded health probe before the engine counts as
//! reachable. Every state transition is published on a watch channel.

use super::api::SharedApi;
use super::models::EngineState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// State Hub
// ============================================================================

/// Shared, observable [`EngineState`]
#[derive(Clone)]
pub struct StateHub {
    sender: Arc<watch::Sender<EngineState>>,
}

impl StateHub {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(EngineState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current state
    pub fn snapshot(&self) -> EngineState {
        self.sender.borrow().clone()
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.sender.subscribe()
    }

    /// Apply a change; subscribers are woken only if something changed
    pub fn update(&self, change: impl FnOnce(&mut EngineState)) -> bool {
        self.sender.send_if_modified(|state| {
            let before = state.clone();
            change(state);
            *state != before
        })
    }
}

impl Default for StateHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Connectivity Monitor
// ============================================================================

/// Result of processing a connectivity signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    /// Server became reachable; a sync pass should run
    Reconnected,
    Disconnected,
    Unchanged,
}

pub struct ConnectivityMonitor {
    api: SharedApi,
    probe_timeout: Duration,
    hub: StateHub,
}

impl ConnectivityMonitor {
    pub fn new(api: SharedApi, probe_timeout: Duration, hub: StateHub) -> Self {
        Self {
            api,
            probe_timeout,
            hub,
        }
    }

    /// Health probe bounded by the probe timeout. Timeout counts as unreachable.
    pub async fn probe(&self) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.api.health_check()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::debug!("Health probe failed: {}", e);
                false
            }
            Err(_) => {
                log::debug!("Health probe timed out after {:?}", self.probe_timeout);
                false
            }
        }
    }

    /// Process a platform online/offline signal
    pub async fn handle_network_event(&self, online: bool) -> ConnectivityChange {
        let was_reachable = self.hub.snapshot().is_reachable;
        let reachable = online && self.probe().await;

        self.hub.update(|state| {
            state.is_online = online;
            state.is_reachable = reachable;
        });

        match (was_reachable, reachable) {
            (false, true) => {
                log::info!("Server reachable again");
                ConnectivityChange::Reconnected
            }
            (true, false) => {
                log::info!("Server no longer reachable (interface {})", if online { "up" } else { "down" });
                ConnectivityChange::Disconnected
            }
            _ => ConnectivityChange::Unchanged,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.hub.snapshot().is_reachable
    }
}

// ============================================================================
// Tests
// ============================================================================
