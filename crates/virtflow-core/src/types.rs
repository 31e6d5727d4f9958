//! Domain types shared across virtflow crates.
//!
//! `Node` mirrors the JSON the node source serves, `SchedulingRequest` is
//! what a caller submits, and `Task` is the unit that travels through the
//! queue. All of them are plain serde types so they can cross every
//! collaborator boundary unchanged.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Unique identifier of a bare-metal node.
pub type NodeName = String;

/// Globally unique identifier of a scheduling task.
pub type TaskId = String;

// ── Node ──────────────────────────────────────────────────────────

/// A bare-metal host that can receive VM workloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: NodeName,
    /// Total CPU cores.
    #[serde(rename = "cpu")]
    pub cpu_total: u32,
    /// Total memory in MiB.
    #[serde(rename = "memory")]
    pub memory_total: u64,
    /// Total storage in GiB.
    #[serde(rename = "storage", default)]
    pub storage_total: u64,
    /// Fraction of CPU in use (0.0–1.0).
    pub usage_cpu: f64,
    /// Fraction of memory in use (0.0–1.0).
    pub usage_mem: f64,
    /// Partition this node belongs to (e.g. "default", "high-performance").
    pub pool: String,
    /// Reserved for single-tenant workloads.
    #[serde(default)]
    pub dedicated: bool,
    #[serde(default)]
    pub model: String,
    #[serde(rename = "max_vms", alias = "max_vm")]
    pub max_vm_slots: u32,
    #[serde(rename = "current_vms", alias = "current_vm", default)]
    pub current_vm_count: u32,
}

impl Node {
    /// Whole CPU cores not currently in use.
    pub fn available_cpu(&self) -> u64 {
        ((1.0 - self.usage_cpu) * f64::from(self.cpu_total)).floor() as u64
    }

    /// Whole MiB of memory not currently in use.
    pub fn available_memory(&self) -> u64 {
        ((1.0 - self.usage_mem) * self.memory_total as f64).floor() as u64
    }

    /// Whether at least one more VM slot is free.
    pub fn has_free_slot(&self) -> bool {
        self.current_vm_count < self.max_vm_slots
    }

    /// Check the data-model invariants: usage fractions in `[0, 1]` and
    /// `current_vm_count <= max_vm_slots`.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(0.0..=1.0).contains(&self.usage_cpu) {
            return Err("usage_cpu outside [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.usage_mem) {
            return Err("usage_mem outside [0, 1]");
        }
        if self.current_vm_count > self.max_vm_slots {
            return Err("current_vms exceeds max_vms");
        }
        Ok(())
    }
}

// ── Request ───────────────────────────────────────────────────────

/// A request to place one VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulingRequest {
    /// CPU cores required.
    pub requested_cpu: u32,
    /// Memory required in MiB.
    pub requested_memory: u64,
    pub requested_pool: String,
    /// Require a dedicated node.
    #[serde(default)]
    pub dedicated: bool,
}

impl SchedulingRequest {
    /// Reject requests that can never be satisfied meaningfully.
    pub fn validate(&self) -> Result<(), String> {
        if self.requested_cpu == 0 {
            return Err("requested_cpu must be positive".to_string());
        }
        if self.requested_memory == 0 {
            return Err("requested_memory must be positive".to_string());
        }
        if self.requested_pool.trim().is_empty() {
            return Err("requested_pool must not be empty".to_string());
        }
        Ok(())
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle status of a scheduling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `Completed` and `Failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Position in the lifecycle; used to order writes for the same attempt.
    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One placement request moving through the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub request: SchedulingRequest,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "pending")]
    pub status: TaskStatus,
    /// Name of the chosen node; only set once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<NodeName>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Create a pending task with a freshly generated identifier.
    pub fn new(request: SchedulingRequest) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), request)
    }

    /// Create a pending task with a caller-provided identifier.
    pub fn with_id(task_id: impl Into<TaskId>, request: SchedulingRequest) -> Self {
        Self {
            task_id: task_id.into(),
            request,
            retry_count: 0,
            status: TaskStatus::Pending,
            assigned_node: None,
        }
    }

    /// `pending → running`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending, TaskStatus::Running)
    }

    /// `running → completed`, recording the chosen node.
    pub fn complete(&mut self, node: impl Into<NodeName>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running, TaskStatus::Completed)?;
        self.assigned_node = Some(node.into());
        Ok(())
    }

    /// `running → failed`.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running, TaskStatus::Failed)
    }

    /// The pending copy of a running task that found no node, with the
    /// retry counter bumped.
    pub fn next_attempt(&self) -> Result<Task, TransitionError> {
        if self.status != TaskStatus::Running {
            return Err(TransitionError {
                task_id: self.task_id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        Ok(Task {
            task_id: self.task_id.clone(),
            request: self.request.clone(),
            retry_count: self.retry_count + 1,
            status: TaskStatus::Pending,
            assigned_node: None,
        })
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SchedulingRequest {
        SchedulingRequest {
            requested_cpu: 4,
            requested_memory: 8192,
            requested_pool: "default".to_string(),
            dedicated: false,
        }
    }

    #[test]
    fn node_available_resources_are_floored() {
        let node: Node = serde_json::from_str(
            r#"{"name":"bm01","cpu":16,"memory":32768,"storage":500,
                "usage_cpu":0.3,"usage_mem":0.4,"pool":"default",
                "dedicated":false,"model":"r740","max_vms":4,"current_vms":1}"#,
        )
        .unwrap();

        // 0.7 * 16 = 11.2, 0.6 * 32768 = 19660.8
        assert_eq!(node.available_cpu(), 11);
        assert_eq!(node.available_memory(), 19660);
        assert!(node.has_free_slot());
    }

    #[test]
    fn node_accepts_legacy_slot_field_names() {
        let node: Node = serde_json::from_str(
            r#"{"name":"bm09","cpu":8,"memory":1024,"usage_cpu":0.0,"usage_mem":0.0,
                "pool":"default","max_vm":2,"current_vm":2}"#,
        )
        .unwrap();
        assert_eq!(node.max_vm_slots, 2);
        assert_eq!(node.current_vm_count, 2);
        assert!(!node.has_free_slot());
        assert!(!node.dedicated);
    }

    #[test]
    fn node_validate_rejects_broken_invariants() {
        let mut node: Node = serde_json::from_str(
            r#"{"name":"bm01","cpu":8,"memory":1024,"usage_cpu":0.5,"usage_mem":0.5,
                "pool":"default","max_vms":2,"current_vms":1}"#,
        )
        .unwrap();
        assert!(node.validate().is_ok());

        node.usage_cpu = 1.2;
        assert!(node.validate().is_err());

        node.usage_cpu = 0.2;
        node.current_vm_count = 3;
        assert!(node.validate().is_err());
    }

    #[test]
    fn request_validation() {
        assert!(request().validate().is_ok());

        let mut r = request();
        r.requested_cpu = 0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.requested_memory = 0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.requested_pool = "  ".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn task_lifecycle_to_completed() {
        let mut task = Task::new(request());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);

        task.start().unwrap();
        task.complete("bm02").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_node.as_deref(), Some("bm02"));

        // Terminal states never move again.
        assert!(task.start().is_err());
        assert!(task.fail().is_err());
        assert!(task.next_attempt().is_err());
    }

    #[test]
    fn next_attempt_returns_to_pending_with_bumped_counter() {
        let mut task = Task::with_id("t-1", request());
        task.start().unwrap();

        let retry = task.next_attempt().unwrap();
        assert_eq!(retry.task_id, "t-1");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, TaskStatus::Pending);
        assert!(retry.assigned_node.is_none());
    }

    #[test]
    fn task_ids_are_unique() {
        let a = Task::new(request());
        let b = Task::new(request());
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn minimal_task_payload_defaults_to_pending() {
        let task: Task = serde_json::from_str(
            r#"{"task_id":"abc","request":{"requested_cpu":1,"requested_memory":512,
                "requested_pool":"default"}}"#,
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(!task.request.dedicated);
    }

    #[test]
    fn status_rank_and_terminality() {
        assert!(TaskStatus::Pending.rank() < TaskStatus::Running.rank());
        assert!(TaskStatus::Running.rank() < TaskStatus::Completed.rank());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }
}
