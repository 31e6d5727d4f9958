//! virtflow-state — task-status persistence for virtflow.
//!
//! Backed by [redb](https://docs.rs/redb). One table maps `task_id` to a
//! JSON-serialized [`StatusRecord`]. Writes go through
//! [`StatusStore::upsert_status`], which enforces monotonic status ordering
//! so duplicate or stale writes from at-least-once delivery can never move
//! a task backwards or out of a terminal state.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StatusStore};
pub use types::*;
