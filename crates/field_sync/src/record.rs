//! Job record types shared by the cache, the queue and the remote service.
//!
//! `JobRecord` is the authoritative shape returned by the remote service.
//! `CachedRecord` wraps it with the local sync status tracked by the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, server-assigned record identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Create a record ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

/// Opaque concurrency token. The server changes it on every write.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        VersionToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Valid transitions live in [`crate::lifecycle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Assigned,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Cancelled,
    ];

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job priority level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Store location a job is attached to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub store_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl Location {
    /// Names of the fields that are blank.
    fn missing_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("storeName", &self.store_name),
            ("address", &self.address),
            ("city", &self.city),
            ("state", &self.state),
            ("zipCode", &self.zip_code),
        ];
        fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect()
    }
}

/// A job as returned by the remote service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: RecordId,
    pub title: String,
    pub description: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub tenant_id: String,
    pub vendor_id: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_name: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_name: Option<String>,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Payload for creating a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub vendor_id: String,
    pub location: Location,
}

impl NewJob {
    /// Check the payload against the rules the remote service enforces,
    /// so a create that is certain to be rejected never reaches the queue.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is required".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("description is required".to_string());
        }
        if self.vendor_id.trim().is_empty() {
            return Err("vendorId is required".to_string());
        }
        let missing = self.location.missing_fields();
        if !missing.is_empty() {
            return Err(format!("location is missing {}", missing.join(", ")));
        }
        Ok(())
    }
}

/// Per-record sync status in the local cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Matches the last copy received from the server.
    Synced,
    /// Carries an optimistic local change whose write intent is still queued.
    Pending,
    /// A write intent failed terminally and needs a user decision.
    Conflict,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Synced
    }
}

/// A record in the local cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl CachedRecord {
    /// Wrap a server record as `synced`.
    pub fn synced(record: JobRecord) -> Self {
        Self {
            record,
            sync_status: SyncStatus::Synced,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.record.id
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn is_conflict(&self) -> bool {
        self.sync_status == SyncStatus::Conflict
    }

    /// Whether the record carries local state the server has not accepted.
    pub fn has_local_changes(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }
}

/// Field changes applied by an optimistic local mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub status: Option<JobStatus>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub location: Option<Location>,
}

impl RecordPatch {
    /// A patch that only moves the lifecycle state.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.location.is_none()
    }

    /// Write the patched fields into `record`.
    pub fn apply_to(&self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(location) = &self.location {
            record.location = location.clone();
        }
    }
}
