//! Sync agent: owns the background tasks and decides when cycles run.
//!
//! The agent starts three tasks next to the engine:
//!
//! - the liveness probe loop feeding the [`ConnectivityMonitor`],
//! - the [`RealtimeChannel`] supervisor,
//! - the orchestrator, which turns timer ticks, connectivity changes,
//!   notifications and manual requests into engine cycles.
//!
//! Cycles are only started while online. The periodic interval widens while
//! the real-time channel is connected, and returning online forces one full
//! resync. A trigger that arrives while a cycle is running is dropped.

use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::engine::{CycleMode, EngineStatus, SyncEngine, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::realtime::{ChannelEvent, ChannelState, ChannelTransport, RealtimeChannel, SessionIdentity};
use crate::remote::{RemoteError, RemoteService};
use crate::store::LocalStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Combined status of the engine and its background tasks.
#[derive(Clone, Debug)]
pub struct AgentStatus {
    pub engine: EngineStatus,
    pub connectivity: ConnectivityState,
    pub channel: ChannelState,
}

enum Command {
    Sync(CycleMode),
    Logout(oneshot::Sender<SyncResult<()>>),
    SignedIn,
}

/// Handle to a running sync agent.
pub struct SyncAgent<S: LocalStore, R: RemoteService> {
    engine: Arc<SyncEngine<S, R>>,
    monitor: Arc<ConnectivityMonitor>,
    channel: RealtimeChannel,
    commands: mpsc::Sender<Command>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, R> SyncAgent<S, R>
where
    S: LocalStore + 'static,
    R: RemoteService + 'static,
{
    /// Start the background tasks. An initial cycle runs right away if the
    /// device is online; the channel waits for [`SyncAgent::set_session`].
    pub fn start<T>(engine: Arc<SyncEngine<S, R>>, transport: Arc<T>) -> Self
    where
        T: ChannelTransport + 'static,
    {
        let config = engine.config().clone();
        let remote = Arc::clone(engine.remote());
        let monitor = Arc::new(ConnectivityMonitor::from_config(&config));
        let (shutdown_tx, _) = broadcast::channel(1);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);

        let probe = monitor.spawn_probe_loop(
            Arc::clone(&remote),
            config.probe_interval(),
            config.probe_timeout(),
            shutdown_tx.subscribe(),
        );
        let channel = RealtimeChannel::spawn(remote, transport, Arc::clone(&monitor), &config, event_tx);

        let orchestrator = Orchestrator {
            engine: Arc::clone(&engine),
            connectivity: monitor.subscribe(),
            monitor: Arc::clone(&monitor),
            events: event_rx,
            commands: command_rx,
            shutdown: shutdown_tx.subscribe(),
            sync_interval: config.sync_interval(),
            realtime_sync_interval: config.realtime_sync_interval(),
            running: None,
            signed_out: false,
        };
        let orchestrate = tokio::spawn(orchestrator.run());

        tracing::info!("Sync agent started");
        Self {
            engine,
            monitor,
            channel,
            commands: command_tx,
            shutdown_tx,
            tasks: Mutex::new(vec![probe, orchestrate]),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine<S, R>> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Follow the channel state, e.g. for a connection indicator.
    pub fn subscribe_channel_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.subscribe_state()
    }

    /// Sign in or out of the real-time channel.
    ///
    /// Signing in after [`SyncAgent::logout`] resumes periodic cycles.
    pub async fn set_session(&self, session: Option<SessionIdentity>) {
        let signed_in = session.is_some();
        self.channel.set_session(session).await;
        if signed_in && self.commands.send(Command::SignedIn).await.is_err() {
            tracing::debug!("Orchestrator gone, sign-in not forwarded");
        }
    }

    /// Forward the platform's network-reachability signal.
    pub fn report_platform_signal(&self, online: bool) {
        self.monitor.report_platform_signal(online);
    }

    /// Called when the host app returns to the foreground.
    pub fn on_foreground(&self, platform_online: bool) {
        tracing::debug!("App foregrounded (platform online: {})", platform_online);
        self.monitor.report_platform_signal(platform_online);
        if platform_online {
            self.request_sync(CycleMode::Delta);
        }
    }

    /// Ask the orchestrator for a cycle without waiting for it.
    pub fn request_sync(&self, mode: CycleMode) {
        if self.commands.try_send(Command::Sync(mode)).is_err() {
            tracing::debug!("Sync request dropped");
        }
    }

    /// Run a cycle now and wait for its report.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        if !self.monitor.is_online() {
            return Err(SyncError::Remote(RemoteError::Unreachable(
                "device is offline".to_string(),
            )));
        }
        self.engine.run_cycle(CycleMode::Delta).await
    }

    /// Close the channel, then drop all local data.
    ///
    /// The channel is torn down before anything is cleared so that no
    /// notification can repopulate the cache afterwards. No cycle runs
    /// until the next [`SyncAgent::set_session`] with a session.
    pub async fn logout(&self) -> SyncResult<()> {
        self.channel.set_session(None).await;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Logout(ack_tx)).await.is_err() {
            return self.engine.clear_local_data();
        }
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => self.engine.clear_local_data(),
        }
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.channel.shutdown().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Sync agent task failed: {}", e);
            }
        }
        tracing::info!("Sync agent stopped");
    }

    pub async fn status(&self) -> SyncResult<AgentStatus> {
        Ok(AgentStatus {
            engine: self.engine.status().await?,
            connectivity: self.monitor.state(),
            channel: self.channel.state(),
        })
    }
}

struct Orchestrator<S: LocalStore, R: RemoteService> {
    engine: Arc<SyncEngine<S, R>>,
    monitor: Arc<ConnectivityMonitor>,
    connectivity: watch::Receiver<ConnectivityState>,
    events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
    sync_interval: Duration,
    realtime_sync_interval: Duration,
    running: Option<JoinHandle<()>>,
    signed_out: bool,
}

impl<S, R> Orchestrator<S, R>
where
    S: LocalStore + 'static,
    R: RemoteService + 'static,
{
    async fn run(mut self) {
        self.trigger(CycleMode::Delta, "startup");

        let initial = *self.connectivity.borrow_and_update();
        let mut was_online = initial.is_online;
        let mut was_connected = initial.is_realtime_connected;
        let mut last_tick = Instant::now();
        let mut next_tick = last_tick + self.interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    self.trigger(CycleMode::Delta, "timer");
                    last_tick = Instant::now();
                    next_tick = last_tick + self.interval();
                }
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.connectivity.borrow_and_update();
                    if state.is_online && !was_online {
                        self.trigger(CycleMode::ForceFull, "reconnect");
                    }
                    if state.is_realtime_connected != was_connected {
                        // The interval changed; measure it from the last tick.
                        next_tick = last_tick + self.interval_for(state);
                    }
                    was_online = state.is_online;
                    was_connected = state.is_realtime_connected;
                }
                Some(event) = self.events.recv() => self.on_event(event),
                Some(command) = self.commands.recv() => match command {
                    Command::Sync(mode) => self.trigger(mode, "request"),
                    Command::Logout(ack) => {
                        let result = self.clear().await;
                        self.signed_out = true;
                        let _ = ack.send(result);
                    }
                    Command::SignedIn => {
                        if std::mem::take(&mut self.signed_out) {
                            self.trigger(CycleMode::Delta, "sign-in");
                        }
                    }
                },
                _ = self.shutdown.recv() => break,
            }
        }

        self.wait_running().await;
        tracing::debug!("Sync orchestrator stopped");
    }

    fn interval(&self) -> Duration {
        self.interval_for(self.monitor.state())
    }

    fn interval_for(&self, state: ConnectivityState) -> Duration {
        if state.is_realtime_connected {
            self.realtime_sync_interval
        } else {
            self.sync_interval
        }
    }

    fn trigger(&mut self, mode: CycleMode, reason: &str) {
        if self.signed_out {
            tracing::debug!("Signed out, skipping {} sync", reason);
            return;
        }
        if !self.monitor.is_online() {
            tracing::debug!("Offline, skipping {} sync", reason);
            return;
        }
        let busy = self.running.as_ref().is_some_and(|task| !task.is_finished());
        if busy || self.engine.is_syncing() {
            tracing::debug!("Sync cycle in flight, dropping {} trigger", reason);
            return;
        }

        tracing::debug!("Starting {} sync ({:?})", reason, mode);
        let engine = Arc::clone(&self.engine);
        self.running = Some(tokio::spawn(async move {
            // The engine logs and records its own failures.
            let _ = engine.run_cycle(mode).await;
        }));
    }

    fn on_event(&mut self, event: ChannelEvent) {
        tracing::debug!("Received {} for {}", event.kind.name(), event.record.id);
        match self.engine.apply_notification(&event) {
            Ok(true) => self.trigger(CycleMode::Delta, "notification"),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to apply {} notification: {}", event.kind.name(), e),
        }
    }

    async fn clear(&mut self) -> SyncResult<()> {
        self.wait_running().await;
        // Drop notifications that arrived before the channel closed.
        while self.events.try_recv().is_ok() {}
        self.engine.clear_local_data()
    }

    async fn wait_running(&mut self) {
        if let Some(task) = self.running.take() {
            if let Err(e) = task.await {
                tracing::error!("Sync cycle task failed: {}", e);
            }
        }
    }
}
