//! Error types shared by virtflow crates.

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// Configuration is missing or unusable. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A task status change that would move backwards or out of a terminal state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {task_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}
