//! Offline-first synchronization for field-service job records.
//!
//! Technicians keep working while the network comes and goes. Every change
//! is applied to a local cache first and recorded as a write intent in a
//! durable queue; the engine later replays the queue against the remote
//! service and pulls server changes back into the cache.
//!
//! # Modules
//!
//! - `record`: Job records, lifecycle states and cache entries
//! - `store`: Durable local storage (in-memory and file-backed)
//! - `cache`: Record cache with pending-aware merging
//! - `queue`: FIFO queue of write intents with a retry budget
//! - `cursor`: Delta-sync cursor and full-resync cadence
//! - `lifecycle`: Lifecycle rules and write outcome classification
//! - `remote`: The remote service interface
//! - `connectivity`: Online/offline detection
//! - `realtime`: Push channel supervision and change notifications
//! - `engine`: The drain and reconcile cycle
//! - `agent`: Background tasks driving the engine
//! - `config`: Tunable intervals, timeouts and budgets
//! - `error`: Error types for the crate
//!
//! # Example
//!
//! ```
//! use field_sync::lifecycle;
//! use field_sync::JobStatus;
//!
//! assert_eq!(lifecycle::next_status(JobStatus::Assigned), Some(JobStatus::InProgress));
//! assert!(!lifecycle::can_transition_to(JobStatus::Completed, JobStatus::InProgress));
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use agent::{AgentStatus, SyncAgent};
pub use cache::LocalCache;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, Transition};
pub use cursor::SyncCursor;
pub use engine::{CycleMode, EngineStatus, RejectedWrite, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use lifecycle::{ConflictView, Resolution, WriteOutcome};
pub use queue::{ActionId, ActionKind, ActionQueue, PendingAction, RetryDecision};
pub use realtime::{
    Backoff, ChannelConnection, ChannelEvent, ChannelEventKind, ChannelGrant, ChannelState,
    ChannelTransport, EventPayload, RealtimeChannel, SessionIdentity,
};
pub use record::{
    CachedRecord, JobRecord, JobStatus, Location, NewJob, Priority, RecordId, RecordPatch,
    SyncStatus, VersionToken,
};
pub use remote::{DeltaResponse, RemoteError, RemoteService};
pub use store::{FileStore, LocalStore, MemoryStore, StorageError, StorageResult};

#[cfg(feature = "hub")]
pub use realtime::hub::HubTransport;
