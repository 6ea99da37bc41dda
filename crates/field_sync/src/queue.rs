//! Pending action queue: the durable, ordered log of write intents.
//!
//! Actions are appended with a monotonic ID and processed strictly in that
//! order. An action leaves the queue only on a terminal outcome: applied,
//! conflicting, rejected, or out of retries.

use crate::record::{JobStatus, NewJob, RecordId, VersionToken};
use crate::store::{LocalStore, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default number of attempts an action gets before it is discarded.
pub const MAX_RETRIES: u32 = 3;

/// Monotonic queue identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A write intent and its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "actionType", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Create a new job.
    CreateRecord(NewJob),
    /// Move a job to a new lifecycle state, guarded by the token seen at enqueue time.
    #[serde(rename_all = "camelCase")]
    UpdateLifecycleState {
        record_id: RecordId,
        status: JobStatus,
        version: VersionToken,
    },
}

impl ActionKind {
    /// The cached record this action touches, if any.
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            ActionKind::CreateRecord(_) => None,
            ActionKind::UpdateLifecycleState { record_id, .. } => Some(record_id),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::CreateRecord(_) => "create-record",
            ActionKind::UpdateLifecycleState { .. } => "update-lifecycle-state",
        }
    }
}

/// A queued write intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: ActionId,
    #[serde(flatten)]
    pub kind: ActionKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// What happened after recording a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// The action stays queued for another attempt.
    Retry { attempts: u32 },
    /// The retry budget is spent; the action has been discarded.
    Exhausted { action: PendingAction },
    /// The action was no longer queued.
    Missing,
}

/// The pending action queue over a [`LocalStore`].
pub struct ActionQueue<S: LocalStore> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: LocalStore> Clone for ActionQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_retries: self.max_retries,
        }
    }
}

impl<S: LocalStore> ActionQueue<S> {
    /// Create a queue with the default retry budget.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_max_retries(store, MAX_RETRIES)
    }

    /// Create a queue with a custom retry budget.
    pub fn with_max_retries(store: Arc<S>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append a write intent stamped with the current time.
    pub fn enqueue(&self, kind: ActionKind) -> StorageResult<PendingAction> {
        let action = self.store.push_action(kind, Utc::now())?;
        tracing::debug!("Queued {} action {}", action.kind.name(), action.id);
        Ok(action)
    }

    /// All queued actions, oldest first.
    pub fn peek_all_ordered(&self) -> StorageResult<Vec<PendingAction>> {
        self.store.list_actions()
    }

    /// The oldest action queued after `after`, or the oldest overall.
    pub fn next_after(&self, after: Option<ActionId>) -> StorageResult<Option<PendingAction>> {
        Ok(self
            .store
            .list_actions()?
            .into_iter()
            .find(|action| after.map_or(true, |after| action.id > after)))
    }

    /// Whether any queued action touches the record.
    pub fn has_actions_for(&self, record_id: &RecordId) -> StorageResult<bool> {
        Ok(self
            .store
            .list_actions()?
            .iter()
            .any(|action| action.kind.record_id() == Some(record_id)))
    }

    /// Move queued lifecycle updates of a record that were guarded by `from`
    /// onto `to`. Used once an earlier update of the same record has been
    /// applied and the server issued a new token. Returns how many actions
    /// changed.
    pub fn rebase(&self, record_id: &RecordId, from: &VersionToken, to: &VersionToken) -> StorageResult<usize> {
        let mut rebased = 0;
        for action in self.store.list_actions()? {
            let ActionKind::UpdateLifecycleState {
                record_id: target,
                version,
                ..
            } = &action.kind
            else {
                continue;
            };
            if target != record_id || version != from {
                continue;
            }
            self.store.update_action(action.id, &mut |queued| {
                if let ActionKind::UpdateLifecycleState { version, .. } = &mut queued.kind {
                    *version = to.clone();
                }
            })?;
            rebased += 1;
        }
        if rebased > 0 {
            tracing::debug!("Rebased {} queued update(s) of {} onto {}", rebased, record_id, to);
        }
        Ok(rebased)
    }

    /// Remove an action after it was applied.
    pub fn dequeue(&self, id: ActionId) -> StorageResult<bool> {
        self.store.remove_action(id)
    }

    /// Increment the retry count and remember the error.
    pub fn mark_failed(&self, id: ActionId, error: &str) -> StorageResult<Option<PendingAction>> {
        self.store.update_action(id, &mut |action| {
            action.retry_count += 1;
            action.last_error = Some(error.to_string());
        })
    }

    /// Remove an action without it having been applied.
    pub fn discard(&self, id: ActionId) -> StorageResult<bool> {
        self.store.remove_action(id)
    }

    /// Record a failed attempt and discard the action once the retry budget
    /// is spent.
    pub fn record_failure(&self, id: ActionId, error: &str) -> StorageResult<RetryDecision> {
        let Some(action) = self.mark_failed(id, error)? else {
            return Ok(RetryDecision::Missing);
        };

        if action.retry_count >= self.max_retries {
            self.discard(id)?;
            tracing::warn!(
                "Discarding {} action {} after {} attempts: {}",
                action.kind.name(),
                id,
                action.retry_count,
                error
            );
            Ok(RetryDecision::Exhausted { action })
        } else {
            Ok(RetryDecision::Retry {
                attempts: action.retry_count,
            })
        }
    }

    /// Number of queued actions.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.store.list_actions()?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}
