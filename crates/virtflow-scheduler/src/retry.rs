//! RetryScheduler — delayed republishing of tasks that found no node.
//!
//! Workers hand a task and its delay to a [`RetryHandle`] and move on. The
//! scheduler keeps pending retries in a min-heap ordered by due time and
//! republishes each one when it comes due. A retry the queue refuses for
//! now (full) goes back on the heap after [`REPUBLISH_BACKOFF`]; one the
//! queue refuses for good is persisted as failed. On shutdown every pending
//! retry is published immediately, and any that cannot be is marked failed
//! so no task stays pending.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use virtflow_core::Task;
use virtflow_core::config::RetryConfig;
use virtflow_state::{StatusStore, StatusUpdate};

use crate::error::{SchedulerError, SchedulerResult};
use crate::queue::{QueueError, TaskQueue};

/// Wait before republishing a retry the queue was too full to take.
pub const REPUBLISH_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff for tasks that found no eligible node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts with `retry_count` below this are retried.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            jitter_ceiling: Duration::from_millis(config.jitter_ceiling_ms),
        }
    }

    /// Whether an attempt that already used `retry_count` retries gets another.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// `base_delay * retry_count + U[0, jitter_ceiling]`.
    ///
    /// `retry_count` is the count of the attempt that just failed, so the
    /// first retry after attempt 0 waits only the jitter.
    pub fn delay<R: Rng>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let ceiling = self.jitter_ceiling.as_millis() as u64;
        let jitter = if ceiling == 0 {
            0
        } else {
            rng.gen_range(0..=ceiling)
        };
        self.base_delay.saturating_mul(retry_count) + Duration::from_millis(jitter)
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct RetryRequest {
    task: Task,
    delay: Duration,
}

/// Cheap clonable handle workers use to schedule retries.
#[derive(Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<RetryRequest>,
    pending: Arc<AtomicUsize>,
}

impl RetryHandle {
    /// Republish `task` after `delay`.
    pub fn schedule(&self, task: Task, delay: Duration) -> SchedulerResult<()> {
        self.pending.fetch_add(1, AtomicOrdering::SeqCst);
        if self.tx.send(RetryRequest { task, delay }).is_err() {
            self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
            return Err(SchedulerError::RetrySchedulerStopped);
        }
        Ok(())
    }

    /// Retries accepted but not yet republished.
    pub fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::SeqCst)
    }
}

pub struct RetryScheduler {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn StatusStore>,
    rx: mpsc::UnboundedReceiver<RetryRequest>,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, store: Arc<dyn StatusStore>) -> (Self, RetryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = RetryHandle {
            tx,
            pending: pending.clone(),
        };
        (
            Self {
                queue,
                store,
                rx,
                pending,
            },
            handle,
        )
    }

    /// Release retries as they come due until shutdown, then flush the rest.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("retry scheduler started");

        let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
        let mut seq: u64 = 0;
        let mut receiving = true;

        loop {
            let next_due = heap.peek().map(|Reverse(s)| s.due);

            tokio::select! {
                _ = shutdown.changed() => {
                    info!(pending = heap.len(), "retry scheduler shutting down");
                    break;
                }
                request = self.rx.recv(), if receiving => match request {
                    Some(RetryRequest { task, delay }) => {
                        debug!(
                            task_id = %task.task_id,
                            retry_count = task.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "retry scheduled"
                        );
                        heap.push(Reverse(Scheduled {
                            due: Instant::now() + delay,
                            seq,
                            task,
                        }));
                        seq += 1;
                    }
                    None => receiving = false,
                },
                _ = sleep_until_due(next_due), if next_due.is_some() => {
                    let now = Instant::now();
                    while heap.peek().is_some_and(|Reverse(s)| s.due <= now) {
                        let Some(Reverse(scheduled)) = heap.pop() else { break };
                        if let Some(task) = self.release(scheduled.task).await {
                            heap.push(Reverse(Scheduled {
                                due: now + REPUBLISH_BACKOFF,
                                seq,
                                task,
                            }));
                            seq += 1;
                        }
                    }
                }
            }

            if !receiving && heap.is_empty() {
                debug!("all retry handles dropped, retry scheduler exiting");
                return;
            }
        }

        // Take anything still in flight on the channel, then publish it all.
        self.rx.close();
        while let Ok(RetryRequest { task, .. }) = self.rx.try_recv() {
            heap.push(Reverse(Scheduled {
                due: Instant::now(),
                seq,
                task,
            }));
            seq += 1;
        }
        self.flush(heap).await;
    }

    /// Republish one due retry. Hands the task back when the queue is
    /// only refusing it for now.
    async fn release(&self, task: Task) -> Option<Task> {
        match self.queue.publish(&task).await {
            Ok(()) => {
                debug!(task_id = %task.task_id, retry_count = task.retry_count, "retry republished");
                self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
                None
            }
            Err(e) if e.is_transient() => {
                warn!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count,
                    error = %e,
                    backoff_ms = REPUBLISH_BACKOFF.as_millis() as u64,
                    "queue refused retry, backing off"
                );
                Some(task)
            }
            Err(e) => {
                self.fail(&task, &e);
                None
            }
        }
    }

    /// Persist a retry that can never be republished as failed.
    fn fail(&self, task: &Task, err: &QueueError) {
        let task_id = &task.task_id;
        let retry_count = task.retry_count;
        error!(%task_id, retry_count, error = %err, "failed to republish retry, marking task failed");
        if let Err(e) = self.store.upsert_status(&StatusUpdate::failed(task_id, retry_count)) {
            warn!(%task_id, error = %e, "failed to persist failed status");
        }
        self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    /// Workers are stopped by now, so a full queue will not drain and every
    /// refusal is final.
    async fn flush(&self, mut heap: BinaryHeap<Reverse<Scheduled>>) {
        let total = heap.len();
        let mut published = 0usize;
        while let Some(Reverse(scheduled)) = heap.pop() {
            match self.queue.publish(&scheduled.task).await {
                Ok(()) => {
                    published += 1;
                    self.pending.fetch_sub(1, AtomicOrdering::SeqCst);
                }
                Err(e) => self.fail(&scheduled.task, &e),
            }
        }
        info!(published, total, "retry scheduler flushed");
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}
