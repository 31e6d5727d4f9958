//! Persisted status types and the monotonic write rule.

use serde::{Deserialize, Serialize};

use virtflow_core::{NodeName, TaskId, TaskStatus};

/// A requested status write for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Chosen node; required for `completed`, ignored otherwise.
    pub node: Option<NodeName>,
    /// Retry attempt this write belongs to.
    pub retry_count: u32,
}

impl StatusUpdate {
    pub fn pending(task_id: &str, retry_count: u32) -> Self {
        Self::new(task_id, TaskStatus::Pending, None, retry_count)
    }

    pub fn running(task_id: &str, retry_count: u32) -> Self {
        Self::new(task_id, TaskStatus::Running, None, retry_count)
    }

    pub fn completed(task_id: &str, node: &str, retry_count: u32) -> Self {
        Self::new(task_id, TaskStatus::Completed, Some(node.to_string()), retry_count)
    }

    pub fn failed(task_id: &str, retry_count: u32) -> Self {
        Self::new(task_id, TaskStatus::Failed, None, retry_count)
    }

    fn new(task_id: &str, status: TaskStatus, node: Option<NodeName>, retry_count: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            node,
            retry_count,
        }
    }

    /// The node that will actually be stored: only completed tasks keep one.
    pub(crate) fn stored_node(&self) -> Option<NodeName> {
        match self.status {
            TaskStatus::Completed => self.node.clone(),
            _ => None,
        }
    }
}

/// Stored status of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeName>,
    pub retry_count: u32,
    /// Unix timestamp (seconds) of the last applied write.
    pub updated_at: u64,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was created or replaced.
    Applied,
    /// The stored record already says exactly this; nothing was written.
    Unchanged,
    /// The write would have moved the task backwards; nothing was written.
    Ignored,
}

/// Decide whether `update` may replace `existing`.
///
/// Terminal records are final. A non-terminal record is replaced only by a
/// write whose `(retry_count, status rank)` is not lower than its own.
pub fn decide(existing: Option<&StatusRecord>, update: &StatusUpdate) -> UpsertOutcome {
    let Some(old) = existing else {
        return UpsertOutcome::Applied;
    };

    if old.status == update.status
        && old.retry_count == update.retry_count
        && old.node == update.stored_node()
    {
        return UpsertOutcome::Unchanged;
    }

    if old.status.is_terminal() {
        return UpsertOutcome::Ignored;
    }

    let old_pos = (old.retry_count, old.status.rank());
    let new_pos = (update.retry_count, update.status.rank());
    if new_pos < old_pos {
        UpsertOutcome::Ignored
    } else {
        UpsertOutcome::Applied
    }
}
