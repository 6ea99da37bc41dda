//! Real-time channel manager.
//!
//! A supervisor task owns the push connection and runs this state machine:
//!
//! ```text
//!                 online + session
//! ┌──────────────┐ ─────────────▶ ┌────────────┐  opened  ┌───────────┐
//! │ Disconnected │                │ Connecting │ ───────▶ │ Connected │
//! └──────────────┘ ◀───────────── └────────────┘          └───────────┘
//!        ▲          failed (backoff)                             │
//!        └───────────────────────────────────────────────────────┘
//!                dropped (backoff) / offline / no session
//! ```
//!
//! The supervisor only connects while the monitor reports online and a
//! session is set, and tears the connection down as soon as either stops
//! being true. Reconnect delays follow [`Backoff`] and reset after every
//! successful connection. Inbound events are forwarded to the orchestrator
//! over an `mpsc` channel.
//!
//! The transport is pluggable through [`ChannelTransport`]; the `hub`
//! feature provides a WebSocket implementation.

#[cfg(feature = "hub")]
pub mod hub;

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::record::{JobRecord, JobStatus};
use crate::remote::{RemoteError, RemoteService};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Identity of the signed-in user, used to negotiate a channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    pub access_token: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Connection details returned by negotiation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGrant {
    pub url: String,
    pub access_token: String,
}

impl fmt::Debug for ChannelGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGrant")
            .field("url", &self.url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Connection state of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Reconnect delay schedule. The last delay repeats once the schedule is
/// exhausted.
#[derive(Clone, Debug)]
pub struct Backoff {
    delays: Vec<Duration>,
    attempt: usize,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::from_secs(30)]
        } else {
            delays
        };
        Self { delays, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let index = self.attempt.min(self.delays.len() - 1);
        self.attempt += 1;
        self.delays[index]
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(SyncConfig::default().reconnect_backoff())
    }
}

/// Kind of change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    RecordCreated,
    RecordStatusChanged,
    RecordAssigned,
    RecordDeleted,
}

impl ChannelEventKind {
    /// Parse a hub target name. The service publishes `Job*` names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RecordCreated" | "JobCreated" => Some(ChannelEventKind::RecordCreated),
            "RecordStatusChanged" | "JobStatusChanged" => Some(ChannelEventKind::RecordStatusChanged),
            "RecordAssigned" | "JobAssigned" => Some(ChannelEventKind::RecordAssigned),
            "RecordDeleted" | "JobDeleted" => Some(ChannelEventKind::RecordDeleted),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelEventKind::RecordCreated => "RecordCreated",
            ChannelEventKind::RecordStatusChanged => "RecordStatusChanged",
            ChannelEventKind::RecordAssigned => "RecordAssigned",
            ChannelEventKind::RecordDeleted => "RecordDeleted",
        }
    }
}

/// Body of a change notification as published by the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(alias = "record")]
    pub job: JobRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

/// An inbound change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub record: JobRecord,
    /// Set for status changes.
    pub previous_status: Option<JobStatus>,
    pub triggered_by: Option<String>,
}

impl ChannelEvent {
    pub fn new(kind: ChannelEventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            record: payload.job,
            previous_status: payload.previous_status,
            triggered_by: payload.triggered_by,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.kind == ChannelEventKind::RecordDeleted
    }
}

/// An open push connection.
///
/// Dropping it closes the connection: the reader task feeding `events` is
/// aborted.
pub struct ChannelConnection {
    events: mpsc::Receiver<ChannelEvent>,
    reader: Option<JoinHandle<()>>,
}

impl ChannelConnection {
    pub fn new(events: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { events, reader: None }
    }

    /// A connection whose events are produced by `reader`.
    pub fn with_reader(events: mpsc::Receiver<ChannelEvent>, reader: JoinHandle<()>) -> Self {
        Self {
            events,
            reader: Some(reader),
        }
    }

    /// Next event, or `None` once the connection has dropped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens push connections from negotiated grants.
#[trait_variant::make(Send)]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, grant: &ChannelGrant) -> Result<ChannelConnection, RemoteError>;
}

enum Command {
    SetSession(Option<SessionIdentity>, oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the channel supervisor task.
pub struct RealtimeChannel {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ChannelState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    /// Start the supervisor. It stays disconnected until a session is set.
    pub fn spawn<R, T>(
        remote: Arc<R>,
        transport: Arc<T>,
        monitor: Arc<ConnectivityMonitor>,
        config: &SyncConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self
    where
        R: RemoteService + 'static,
        T: ChannelTransport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let supervisor = Supervisor {
            remote,
            transport,
            online: monitor.subscribe(),
            monitor,
            commands: command_rx,
            state: state_tx,
            events,
            session: None,
            backoff: Backoff::new(config.reconnect_backoff()),
            read_timeout: config.read_timeout(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            commands: command_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Set or clear the session.
    ///
    /// Returns once the supervisor has applied the change. After clearing
    /// the session, no connection is open and no reconnect is scheduled.
    pub async fn set_session(&self, session: Option<SessionIdentity>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::SetSession(session, ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Stop the supervisor and wait for it to drop the connection.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Real-time channel supervisor failed: {}", e);
            }
        }
    }
}

/// Why the connected phase ended.
enum Exit {
    Dropped,
    Offline,
    Command(Option<Command>),
    Stop,
}

enum Attempt {
    Opened(Result<ChannelConnection, RemoteError>),
    Command(Option<Command>),
    Offline,
}

struct Supervisor<R, T> {
    remote: Arc<R>,
    transport: Arc<T>,
    monitor: Arc<ConnectivityMonitor>,
    online: watch::Receiver<ConnectivityState>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ChannelState>,
    events: mpsc::Sender<ChannelEvent>,
    session: Option<SessionIdentity>,
    backoff: Backoff,
    read_timeout: Duration,
}

impl<R, T> Supervisor<R, T>
where
    R: RemoteService + 'static,
    T: ChannelTransport + 'static,
{
    async fn run(mut self) {
        loop {
            // Disconnected: wait for a session and connectivity.
            let session = match self.session.clone() {
                Some(session) if self.online.borrow().is_online => session,
                _ => {
                    self.set_state(ChannelState::Disconnected);
                    self.backoff.reset();
                    let has_session = self.session.is_some();
                    let command = tokio::select! {
                        command = self.commands.recv() => Some(command),
                        _ = wait_online(&mut self.online, true), if has_session => None,
                    };
                    if let Some(command) = command {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    continue;
                }
            };

            // Connecting
            self.set_state(ChannelState::Connecting);
            let attempt = tokio::select! {
                result = open(self.remote.as_ref(), self.transport.as_ref(), &session, self.read_timeout) => {
                    Attempt::Opened(result)
                }
                command = self.commands.recv() => Attempt::Command(command),
                _ = wait_online(&mut self.online, false) => Attempt::Offline,
            };
            let mut connection = match attempt {
                Attempt::Opened(Ok(connection)) => connection,
                Attempt::Opened(Err(e)) => {
                    self.set_state(ChannelState::Disconnected);
                    tracing::warn!("Real-time channel failed to connect: {}", e);
                    if !self.wait_backoff().await {
                        break;
                    }
                    continue;
                }
                Attempt::Command(command) => {
                    if !self.apply(command) {
                        break;
                    }
                    continue;
                }
                Attempt::Offline => continue,
            };

            // Connected
            self.backoff.reset();
            self.set_state(ChannelState::Connected);
            self.monitor.set_realtime_connected(true);
            tracing::info!("Real-time channel connected for {}", session.user_id);

            let exit = loop {
                tokio::select! {
                    event = connection.recv() => match event {
                        Some(event) => {
                            tracing::debug!("Received {} for {}", event.kind.name(), event.record.id);
                            if self.events.send(event).await.is_err() {
                                break Exit::Stop;
                            }
                        }
                        None => break Exit::Dropped,
                    },
                    command = self.commands.recv() => break Exit::Command(command),
                    _ = wait_online(&mut self.online, false) => break Exit::Offline,
                }
            };

            drop(connection);
            self.monitor.set_realtime_connected(false);
            self.set_state(ChannelState::Disconnected);

            match exit {
                Exit::Dropped => {
                    tracing::warn!("Real-time channel dropped");
                    if !self.wait_backoff().await {
                        break;
                    }
                }
                Exit::Offline => tracing::info!("Real-time channel closed while offline"),
                Exit::Command(command) => {
                    if !self.apply(command) {
                        break;
                    }
                }
                Exit::Stop => break,
            }
        }

        self.monitor.set_realtime_connected(false);
        self.set_state(ChannelState::Disconnected);
        tracing::debug!("Real-time channel supervisor stopped");
    }

    /// Sleep for the next backoff delay. Connectivity loss or a command cuts
    /// the wait short. Returns `false` when the supervisor should stop.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        tracing::info!(
            "Reconnecting real-time channel in {:?} (attempt {})",
            delay,
            self.backoff.attempt()
        );

        let command = tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            command = self.commands.recv() => Some(command),
            _ = wait_online(&mut self.online, false) => None,
        };
        match command {
            Some(command) => self.apply(command),
            None => true,
        }
    }

    /// Apply a command. Returns `false` on shutdown.
    fn apply(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::SetSession(session, ack)) => {
                if session.is_none() && self.session.is_some() {
                    tracing::info!("Real-time channel session cleared");
                }
                self.session = session;
                let _ = ack.send(());
                true
            }
            Some(Command::Shutdown) | None => false,
        }
    }

    fn set_state(&self, state: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            tracing::debug!("Real-time channel {}", state);
        }
    }
}

async fn wait_online(rx: &mut watch::Receiver<ConnectivityState>, online: bool) {
    if rx.wait_for(|state| state.is_online == online).await.is_err() {
        // The monitor is gone; nothing will change any more.
        std::future::pending::<()>().await;
    }
}

async fn open<R, T>(
    remote: &R,
    transport: &T,
    session: &SessionIdentity,
    deadline: Duration,
) -> Result<ChannelConnection, RemoteError>
where
    R: RemoteService,
    T: ChannelTransport,
{
    let grant = tokio::time::timeout(deadline, remote.negotiate(session))
        .await
        .map_err(|_| RemoteError::Timeout)??;
    tokio::time::timeout(deadline, transport.connect(&grant))
        .await
        .map_err(|_| RemoteError::Timeout)?
}
