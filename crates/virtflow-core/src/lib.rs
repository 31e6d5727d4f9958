//! virtflow-core — domain types and configuration shared by every virtflow crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::VirtflowConfig;
pub use error::{ConfigError, TransitionError};
pub use types::*;
