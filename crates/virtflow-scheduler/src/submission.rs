//! Submission and status lookup, the two operations callers see.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use virtflow_core::{SchedulingRequest, Task, TaskId};
use virtflow_state::{StatusRecord, StatusStore, StatusUpdate};

use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::TaskQueue;

/// Returned to the caller once a task is on the queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub message: String,
}

#[derive(Clone)]
pub struct Submitter {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn StatusStore>,
    publish_timeout: Duration,
}

impl Submitter {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn StatusStore>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            publish_timeout,
        }
    }

    /// Validate the request, publish a fresh pending task, and record it.
    ///
    /// The pending record is written after the publish succeeds; a worker
    /// that gets there first is not overwritten. A failed status write is
    /// logged and does not fail the submission.
    pub async fn submit(&self, request: SchedulingRequest) -> SchedulerResult<SubmitReceipt> {
        request.validate().map_err(SchedulerError::InvalidRequest)?;

        let task = Task::new(request);
        tokio::time::timeout(self.publish_timeout, self.queue.publish(&task))
            .await
            .map_err(|_| SchedulerError::PublishTimeout(self.publish_timeout))??;

        if let Err(e) = self.store.upsert_status(&StatusUpdate::pending(&task.task_id, 0)) {
            warn!(task_id = %task.task_id, error = %e, "failed to record pending status");
        }

        info!(
            task_id = %task.task_id,
            cpu = task.request.requested_cpu,
            memory = task.request.requested_memory,
            pool = %task.request.requested_pool,
            dedicated = task.request.dedicated,
            "task submitted"
        );
        Ok(SubmitReceipt {
            task_id: task.task_id,
            message: "Task submitted".to_string(),
        })
    }

    /// Current status of a task, `None` if it is unknown.
    pub fn status(&self, task_id: &str) -> SchedulerResult<Option<StatusRecord>> {
        Ok(self.store.get_status(task_id)?)
    }
}
