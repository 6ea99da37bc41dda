//! Connectivity monitor.
//!
//! Two producers feed one state machine: the platform's network signal and
//! an active liveness probe against the remote service. The platform signal
//! moves the state directly. Probes are debounced: it takes
//! `failure_threshold` consecutive failures to go offline, and a single
//! success to come back.
//!
//! ```text
//!            probe ok / platform up
//!   ┌────────┐ ◀──────────────────── ┌─────────┐
//!   │ online │                       │ offline │
//!   └────────┘ ────────────────────▶ └─────────┘
//!      N probe failures / platform down
//! ```
//!
//! State is published on a `watch` channel; subscribers see the latest value.

use crate::config::SyncConfig;
use crate::remote::RemoteService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// In-memory connectivity state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub is_realtime_connected: bool,
    pub consecutive_health_failures: u32,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            is_online: true,
            is_realtime_connected: false,
            consecutive_health_failures: 0,
        }
    }
}

/// An online/offline edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

/// Reachability state machine.
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
    failure_threshold: u32,
}

impl ConnectivityMonitor {
    /// Create a monitor that starts online.
    pub fn new(failure_threshold: u32) -> Self {
        let (state, _) = watch::channel(ConnectivityState::default());
        Self {
            state,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.probe_failure_threshold)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    /// Receive every future state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Apply the platform network signal.
    pub fn report_platform_signal(&self, online: bool) -> Option<Transition> {
        let transition = self.update(|state| {
            if online {
                state.consecutive_health_failures = 0;
            }
            set_online(state, online)
        });
        log_transition(transition, "platform signal");
        transition
    }

    /// Apply the result of one liveness probe.
    pub fn record_probe(&self, success: bool) -> Option<Transition> {
        let threshold = self.failure_threshold;
        let transition = self.update(|state| {
            if success {
                state.consecutive_health_failures = 0;
                set_online(state, true)
            } else {
                state.consecutive_health_failures = state.consecutive_health_failures.saturating_add(1);
                if state.consecutive_health_failures >= threshold {
                    set_online(state, false)
                } else {
                    None
                }
            }
        });
        log_transition(transition, "liveness probe");
        transition
    }

    pub fn set_realtime_connected(&self, connected: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_realtime_connected != connected;
            state.is_realtime_connected = connected;
            changed
        });
    }

    fn update(&self, f: impl FnOnce(&mut ConnectivityState) -> Option<Transition>) -> Option<Transition> {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let before = *state;
            transition = f(state);
            *state != before
        });
        transition
    }

    /// Probe the remote service every `interval` until `shutdown` fires.
    ///
    /// A probe that does not answer within `timeout` counts as a failure.
    pub fn spawn_probe_loop<R>(
        self: &Arc<Self>,
        remote: Arc<R>,
        interval: Duration,
        timeout: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        R: RemoteService + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv() => break,
                }

                let success = matches!(tokio::time::timeout(timeout, remote.probe()).await, Ok(true));
                monitor.record_probe(success);
            }
            tracing::debug!("Liveness probe loop stopped");
        })
    }
}

fn set_online(state: &mut ConnectivityState, online: bool) -> Option<Transition> {
    if state.is_online == online {
        return None;
    }
    state.is_online = online;
    Some(if online {
        Transition::WentOnline
    } else {
        Transition::WentOffline
    })
}

fn log_transition(transition: Option<Transition>, source: &str) {
    match transition {
        Some(Transition::WentOnline) => tracing::info!("Back online ({})", source),
        Some(Transition::WentOffline) => tracing::info!("Went offline ({})", source),
        None => {}
    }
}
