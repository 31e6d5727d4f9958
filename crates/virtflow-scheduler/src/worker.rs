//! Worker — consumes tasks and places them on nodes.
//!
//! For each delivery a worker decodes the task, marks it running, asks the
//! selector for a node from the current inventory snapshot, and persists
//! the result. A task with no eligible node is handed to the retry
//! scheduler until its retries run out, then marked failed.
//!
//! Deliveries are acknowledged once the outcome is decided, including
//! malformed payloads, which are dropped rather than redelivered forever.
//! Status-store errors are logged and never block acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use virtflow_core::{NodeName, Task};
use virtflow_placement::Selector;
use virtflow_state::{StatusStore, StatusUpdate, UpsertOutcome};

use crate::error::{SchedulerError, SchedulerResult};
use crate::inventory::NodeInventory;
use crate::queue::{Delivery, TaskQueue};
use crate::retry::{RetryHandle, RetryPolicy};

/// What a worker did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Placed on `node`.
    Completed { node: NodeName },
    /// No node; the next attempt was scheduled after `delay`.
    Retrying { retry_count: u32, delay: Duration },
    /// No node and no retries left.
    Failed,
    /// The payload was not a pending task.
    Dropped,
    /// Duplicate or stale delivery of a task that already moved on.
    Skipped,
    /// The retry could not be scheduled; the message is returned to the queue.
    Abandoned,
}

/// One queue consumer. Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    inventory: Arc<NodeInventory>,
    store: Arc<dyn StatusStore>,
    retries: RetryHandle,
    selector: Selector,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        inventory: Arc<NodeInventory>,
        store: Arc<dyn StatusStore>,
        retries: RetryHandle,
        selector: Selector,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id: 0,
            queue,
            inventory,
            store,
            retries,
            selector,
            policy,
        }
    }

    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Consume until shutdown or until the queue closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.id, "worker started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(worker = self.id, "worker shutting down");
                    break;
                }
                delivery = self.queue.consume() => match delivery {
                    Some(delivery) => {
                        self.process(delivery);
                    }
                    None => {
                        debug!(worker = self.id, "queue closed, worker exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Handle one delivery and settle it with the queue.
    pub fn process(&self, delivery: Delivery) -> Outcome {
        let outcome = self.handle(delivery.payload());
        if outcome == Outcome::Abandoned {
            delivery.nack();
        } else {
            delivery.ack();
        }
        outcome
    }

    /// Decide and persist the outcome for one raw payload.
    pub fn handle(&self, payload: &[u8]) -> Outcome {
        let mut task: Task = match serde_json::from_slice(payload) {
            Ok(task) => task,
            Err(e) => {
                let err = SchedulerError::MalformedPayload(e.to_string());
                warn!(worker = self.id, error = %err, bytes = payload.len(), "dropping message");
                return Outcome::Dropped;
            }
        };

        if let Err(e) = task.start() {
            warn!(worker = self.id, error = %e, "dropping message that is not a pending task");
            return Outcome::Dropped;
        }

        if self.already_finished(&task.task_id) {
            debug!(worker = self.id, task_id = %task.task_id, "task already finished, skipping duplicate");
            return Outcome::Skipped;
        }

        if let Some(UpsertOutcome::Ignored) =
            self.persist(StatusUpdate::running(&task.task_id, task.retry_count))
        {
            debug!(
                worker = self.id,
                task_id = %task.task_id,
                retry_count = task.retry_count,
                "stale delivery of an earlier attempt, skipping"
            );
            return Outcome::Skipped;
        }

        match self.place(&task) {
            Ok(node) => self.complete(task, node),
            Err(e) => {
                debug!(worker = self.id, error = %e, retry_count = task.retry_count, "placement failed");
                self.retry_or_fail(task)
            }
        }
    }

    fn place(&self, task: &Task) -> SchedulerResult<NodeName> {
        let snapshot = self.inventory.snapshot();
        self.selector
            .select(&task.request, snapshot.nodes())
            .map(|node| node.name.clone())
            .ok_or_else(|| SchedulerError::NoEligibleNode(task.task_id.clone()))
    }

    fn complete(&self, mut task: Task, node: NodeName) -> Outcome {
        if let Err(e) = task.complete(node.clone()) {
            error!(worker = self.id, error = %e, "invalid task transition");
            return Outcome::Dropped;
        }
        info!(
            worker = self.id,
            task_id = %task.task_id,
            node = %node,
            retry_count = task.retry_count,
            "task placed"
        );
        self.persist(StatusUpdate::completed(&task.task_id, &node, task.retry_count));
        Outcome::Completed { node }
    }

    fn retry_or_fail(&self, mut task: Task) -> Outcome {
        if self.policy.should_retry(task.retry_count) {
            let next = match task.next_attempt() {
                Ok(next) => next,
                Err(e) => {
                    error!(worker = self.id, error = %e, "invalid task transition");
                    return Outcome::Dropped;
                }
            };
            let delay = self.policy.delay(task.retry_count, &mut rand::thread_rng());
            let retry_count = next.retry_count;
            let task_id = next.task_id.clone();

            if let Err(e) = self.retries.schedule(next, delay) {
                error!(worker = self.id, %task_id, error = %e, "could not schedule retry");
                return Outcome::Abandoned;
            }
            info!(
                worker = self.id,
                %task_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "no eligible node, retry scheduled"
            );
            self.persist(StatusUpdate::pending(&task_id, retry_count));
            return Outcome::Retrying { retry_count, delay };
        }

        if let Err(e) = task.fail() {
            error!(worker = self.id, error = %e, "invalid task transition");
            return Outcome::Dropped;
        }
        error!(
            worker = self.id,
            task_id = %task.task_id,
            retry_count = task.retry_count,
            "no eligible node and retries exhausted, task failed"
        );
        self.persist(StatusUpdate::failed(&task.task_id, task.retry_count));
        Outcome::Failed
    }

    fn already_finished(&self, task_id: &str) -> bool {
        match self.store.get_status(task_id) {
            Ok(record) => record.is_some_and(|r| r.status.is_terminal()),
            Err(e) => {
                warn!(worker = self.id, %task_id, error = %e, "status lookup failed");
                false
            }
        }
    }

    fn persist(&self, update: StatusUpdate) -> Option<UpsertOutcome> {
        match self.store.upsert_status(&update) {
            Ok(outcome) => {
                if outcome == UpsertOutcome::Ignored {
                    debug!(
                        worker = self.id,
                        task_id = %update.task_id,
                        status = %update.status,
                        "status write ignored, record already further along"
                    );
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    task_id = %update.task_id,
                    status = %update.status,
                    error = %e,
                    "failed to persist status"
                );
                None
            }
        }
    }
}

/// A fixed set of workers sharing one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` clones of `worker`, numbered from 0.
    pub fn spawn(worker: Worker, count: usize, shutdown: watch::Receiver<bool>) -> Self {
        let handles = (0..count)
            .map(|id| {
                let worker = worker.clone().with_id(id);
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        info!(workers = count, "worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        debug!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::retry::RetryScheduler;
    use crate::source::StaticNodeSource;
    use virtflow_core::{Node, SchedulingRequest, TaskStatus};
    use virtflow_state::StateStore;

    fn node(name: &str, usage: f64, current: u32, max: u32) -> Node {
        Node {
            name: name.to_string(),
            cpu_total: 16,
            memory_total: 32768,
            storage_total: 500,
            usage_cpu: usage,
            usage_mem: usage,
            pool: "default".to_string(),
            dedicated: false,
            model: "r740".to_string(),
            max_vm_slots: max,
            current_vm_count: current,
        }
    }

    fn request() -> SchedulingRequest {
        SchedulingRequest {
            requested_cpu: 4,
            requested_memory: 8192,
            requested_pool: "default".to_string(),
            dedicated: false,
        }
    }

    fn payload(task: &Task) -> Vec<u8> {
        serde_json::to_vec(task).unwrap()
    }

    struct Harness {
        worker: Worker,
        store: StateStore,
        retries: RetryHandle,
        // Keeps the retry channel open.
        _scheduler: RetryScheduler,
    }

    async fn harness(nodes: Vec<Node>) -> Harness {
        let queue = MemoryQueue::with_capacity(16);
        let store = StateStore::open_in_memory().unwrap();
        let inventory = Arc::new(NodeInventory::new(
            Arc::new(StaticNodeSource::new(nodes)),
            Duration::from_secs(10),
        ));
        inventory.refresh().await.unwrap();

        let (scheduler, retries) =
            RetryScheduler::new(Arc::new(queue.clone()), Arc::new(store.clone()));
        let worker = Worker::new(
            Arc::new(queue),
            inventory,
            Arc::new(store.clone()),
            retries.clone(),
            Selector::default(),
            RetryPolicy::default(),
        );
        Harness {
            worker,
            store,
            retries,
            _scheduler: scheduler,
        }
    }

    #[tokio::test]
    async fn places_task_on_best_node() {
        let h = harness(vec![node("bm01", 0.3, 1, 4), node("bm02", 0.1, 0, 4)]).await;
        let task = Task::with_id("t-1", request());

        let outcome = h.worker.handle(&payload(&task));
        assert_eq!(outcome, Outcome::Completed { node: "bm02".to_string() });

        let record = h.store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.node.as_deref(), Some("bm02"));
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn no_node_schedules_retry_and_persists_pending() {
        let h = harness(vec![node("bm01", 0.1, 4, 4)]).await;
        let task = Task::with_id("t-1", request());

        match h.worker.handle(&payload(&task)) {
            Outcome::Retrying { retry_count, delay } => {
                assert_eq!(retry_count, 1);
                assert!(delay <= Duration::from_secs(10));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(h.retries.pending(), 1);

        let record = h.store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn last_attempt_without_node_fails() {
        let h = harness(vec![node("bm01", 0.1, 4, 4)]).await;
        let mut task = Task::with_id("t-1", request());
        task.retry_count = 3;

        assert_eq!(h.worker.handle(&payload(&task)), Outcome::Failed);
        assert_eq!(h.retries.pending(), 0);

        let record = h.store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 3);
        assert!(record.node.is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let h = harness(vec![node("bm01", 0.1, 0, 4)]).await;
        assert_eq!(h.worker.handle(b"{not json"), Outcome::Dropped);
        assert_eq!(h.worker.handle(br#"{"task_id":"t-1"}"#), Outcome::Dropped);
    }

    #[tokio::test]
    async fn non_pending_payload_is_dropped() {
        let h = harness(vec![node("bm01", 0.1, 0, 4)]).await;
        let mut task = Task::with_id("t-1", request());
        task.status = TaskStatus::Completed;
        assert_eq!(h.worker.handle(&payload(&task)), Outcome::Dropped);
        assert!(h.store.get_status("t-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_of_finished_task_is_skipped() {
        let h = harness(vec![node("bm01", 0.1, 0, 4), node("bm02", 0.0, 0, 4)]).await;
        h.store
            .upsert_status(&StatusUpdate::completed("t-1", "bm01", 0))
            .unwrap();

        let task = Task::with_id("t-1", request());
        assert_eq!(h.worker.handle(&payload(&task)), Outcome::Skipped);

        let record = h.store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.node.as_deref(), Some("bm01"));
    }

    #[tokio::test]
    async fn stale_attempt_is_skipped() {
        let h = harness(vec![node("bm01", 0.1, 0, 4)]).await;
        h.store.upsert_status(&StatusUpdate::pending("t-1", 2)).unwrap();

        let mut task = Task::with_id("t-1", request());
        task.retry_count = 1;
        assert_eq!(h.worker.handle(&payload(&task)), Outcome::Skipped);

        let record = h.store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 2);
    }

    #[tokio::test]
    async fn retry_that_cannot_be_scheduled_is_abandoned() {
        let queue = MemoryQueue::with_capacity(16);
        let store = StateStore::open_in_memory().unwrap();
        let inventory = Arc::new(NodeInventory::new(
            Arc::new(StaticNodeSource::new(vec![])),
            Duration::from_secs(10),
        ));
        let (scheduler, retries) =
            RetryScheduler::new(Arc::new(queue.clone()), Arc::new(store.clone()));
        drop(scheduler);

        let worker = Worker::new(
            Arc::new(queue.clone()),
            inventory,
            Arc::new(store.clone()),
            retries,
            Selector::default(),
            RetryPolicy::default(),
        );

        queue.publish(&Task::with_id("t-1", request())).await.unwrap();
        let delivery = queue.consume().await.unwrap();
        assert_eq!(worker.process(delivery), Outcome::Abandoned);

        // Returned to the queue for another try.
        assert_eq!(queue.len(), 1);
        let record = store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let queue = MemoryQueue::with_capacity(16);
        let store = StateStore::open_in_memory().unwrap();
        let inventory = Arc::new(NodeInventory::new(
            Arc::new(StaticNodeSource::new(vec![node("bm01", 0.1, 0, 64)])),
            Duration::from_secs(10),
        ));
        inventory.refresh().await.unwrap();
        let (_scheduler, retries) =
            RetryScheduler::new(Arc::new(queue.clone()), Arc::new(store.clone()));

        let worker = Worker::new(
            Arc::new(queue.clone()),
            inventory,
            Arc::new(store.clone()),
            retries,
            Selector::default(),
            RetryPolicy::default(),
        );
        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(worker, 3, rx);
        assert_eq!(pool.len(), 3);

        for i in 0..10 {
            queue
                .publish(&Task::with_id(format!("t-{i}"), request()))
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give the last deliveries time to be persisted.
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(true).unwrap();
        pool.join().await;

        for i in 0..10 {
            let record = store.get_status(&format!("t-{i}")).unwrap().unwrap();
            assert_eq!(record.status, TaskStatus::Completed);
        }
    }
}
