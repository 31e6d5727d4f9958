//! Scheduler error types.
//!
//! Every collaborator error is converted into one of these variants where
//! it is first observed.

use std::time::Duration;

use thiserror::Error;

use virtflow_core::{ConfigError, TaskId};

use crate::queue::QueueError;
use crate::source::SourceError;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("node source unavailable: {0}")]
    TransientSource(#[from] SourceError),

    #[error("malformed task payload: {0}")]
    MalformedPayload(String),

    #[error("no eligible node for task {0}")]
    NoEligibleNode(TaskId),

    #[error("status store error: {0}")]
    Persistence(#[from] virtflow_state::StateError),

    #[error("failed to publish task: {0}")]
    QueuePublish(#[from] QueueError),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("invalid scheduling request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("retry scheduler is not running")]
    RetrySchedulerStopped,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
