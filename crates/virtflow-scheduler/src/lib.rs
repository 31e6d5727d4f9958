//! virtflow-scheduler — drives placement requests from queue to node.
//!
//! # Architecture
//!
//! ```text
//! Submitter ──publish──▶ TaskQueue ──consume──▶ WorkerPool
//!                            ▲                     │
//!                            │                     ├── NodeInventory (latest snapshot)
//!                   RetryScheduler ◀──no match─────┤── Selector (virtflow-placement)
//!                   (delay queue)                  └── StatusStore (virtflow-state)
//!
//! NodeInventory ◀──refresh every N seconds── NodeSource (HTTP / file)
//! ```
//!
//! Workers never sleep on the processing path: a task that finds no node
//! is handed to the `RetryScheduler`, which republishes it once its backoff
//! delay has elapsed.

pub mod error;
pub mod inventory;
pub mod queue;
pub mod retry;
pub mod source;
pub mod submission;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use inventory::{InventorySnapshot, NodeInventory};
pub use queue::{Acknowledger, Delivery, MemoryQueue, QueueError, TaskQueue};
pub use retry::{RetryHandle, RetryPolicy, RetryScheduler};
pub use source::{
    FileNodeSource, HttpNodeSource, NodeSource, SourceError, StaticNodeSource,
    source_from_config,
};
pub use submission::{SubmitReceipt, Submitter};
pub use worker::{Outcome, Worker, WorkerPool};
