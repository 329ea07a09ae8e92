//! Broker heartbeat tracking.
//!
//! This state is local to the active controller and is never replicated. It tracks when each
//! broker was last heard from and whether a broker has asked to be shut down, and it decides how
//! a heartbeat moves a broker between control states. The replicated effects of those decisions
//! are always expressed as records by the `ClusterControlManager`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::models::BrokerHeartbeatRequest;
use crate::BrokerId;

/// The control state of a broker, as seen by the heartbeat processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerControlState {
    /// The broker is registered but not eligible to host data.
    Fenced,
    /// The broker is registered and eligible to host data.
    Unfenced,
    /// The broker has asked to shut down and is waiting for it to be safe to do so.
    PendingControlledShutdown,
    /// The broker should shut down immediately. It is fenced as part of this transition.
    ShutdownNow,
}

impl BrokerControlState {
    /// Check if a broker in this state is fenced.
    pub fn fenced(&self) -> bool {
        matches!(self, Self::Fenced | Self::ShutdownNow)
    }

    /// Check if a broker in this state is in controlled shutdown.
    pub fn in_controlled_shutdown(&self) -> bool {
        matches!(self, Self::PendingControlledShutdown)
    }

    /// Check if a broker in this state should shut down.
    pub fn should_shut_down(&self) -> bool {
        matches!(self, Self::ShutdownNow)
    }
}

/// The control state of a broker before and after a heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerControlStates {
    pub current: BrokerControlState,
    pub next: BrokerControlState,
}

/// The liveness data tracked for a single broker.
#[derive(Clone, Copy, Debug)]
struct BrokerHeartbeatState {
    /// The last time the broker was heard from.
    last_contact: Instant,
    /// Whether the broker has asked to be shut down.
    controlled_shutdown: bool,
}

/// Tracks broker liveness against a session timeout.
pub struct BrokerHeartbeatManager {
    clock: Arc<dyn Clock>,
    session_timeout: Duration,
    brokers: HashMap<BrokerId, BrokerHeartbeatState>,
}

impl BrokerHeartbeatManager {
    /// Create a new instance.
    pub fn new(clock: Arc<dyn Clock>, session_timeout: Duration) -> Self {
        Self {
            clock,
            session_timeout,
            brokers: HashMap::new(),
        }
    }

    /// Start a fresh session for the given broker, discarding any previous tracking data.
    pub fn register(&mut self, id: BrokerId) {
        let last_contact = self.clock.now();
        self.brokers.insert(
            id,
            BrokerHeartbeatState {
                last_contact,
                controlled_shutdown: false,
            },
        );
    }

    /// Record contact from the given broker.
    pub fn touch(&mut self, id: BrokerId) {
        let last_contact = self.clock.now();
        let state = self.brokers.entry(id).or_insert(BrokerHeartbeatState {
            last_contact,
            controlled_shutdown: false,
        });
        state.last_contact = last_contact;
    }

    /// Stop tracking the given broker.
    pub fn remove(&mut self, id: BrokerId) {
        self.brokers.remove(&id);
    }

    /// Stop tracking all brokers.
    pub fn clear(&mut self) {
        self.brokers.clear();
    }

    /// Check if the given broker has been heard from within the session timeout.
    pub fn has_valid_session(&self, id: BrokerId) -> bool {
        match self.brokers.get(&id) {
            Some(state) => self.clock.now().saturating_duration_since(state.last_contact) < self.session_timeout,
            None => false,
        }
    }

    /// Check if the given broker has asked to be shut down.
    pub fn in_controlled_shutdown(&self, id: BrokerId) -> bool {
        self.brokers.get(&id).map(|state| state.controlled_shutdown).unwrap_or(false)
    }

    /// Mark whether the given broker is in controlled shutdown.
    pub fn set_controlled_shutdown(&mut self, id: BrokerId, controlled_shutdown: bool) {
        if let Some(state) = self.brokers.get_mut(&id) {
            state.controlled_shutdown = controlled_shutdown;
        }
    }

    /// All tracked brokers whose session has expired, in ascending ID order.
    pub fn stale_brokers(&self) -> Vec<BrokerId> {
        let now = self.clock.now();
        let mut stale: Vec<_> = self
            .brokers
            .iter()
            .filter(|(_, state)| now.saturating_duration_since(state.last_contact) >= self.session_timeout)
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();
        stale
    }

    /// Calculate the control state which the given heartbeat moves the broker into.
    ///
    /// `fenced` is the broker's replicated fencing state. `shutdown_ready` indicates whether the
    /// controller considers it safe for a broker in controlled shutdown to stop.
    pub fn calculate_next_state(&self, request: &BrokerHeartbeatRequest, fenced: bool, shutdown_ready: bool) -> BrokerControlStates {
        use BrokerControlState::*;
        let current = if fenced {
            Fenced
        } else if self.in_controlled_shutdown(request.broker_id) {
            PendingControlledShutdown
        } else {
            Unfenced
        };
        let next = match current {
            Fenced if request.want_shut_down => ShutdownNow,
            Fenced if request.want_fence => Fenced,
            Fenced => Unfenced,
            Unfenced if request.want_shut_down && shutdown_ready => ShutdownNow,
            Unfenced if request.want_shut_down => PendingControlledShutdown,
            Unfenced if request.want_fence => Fenced,
            Unfenced => Unfenced,
            PendingControlledShutdown if shutdown_ready => ShutdownNow,
            PendingControlledShutdown => PendingControlledShutdown,
            ShutdownNow => ShutdownNow,
        };
        BrokerControlStates { current, next }
    }
}
