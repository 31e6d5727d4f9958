//! StateStore — redb-backed task-status persistence.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! read-decide-write of an upsert happens inside a single write
//! transaction, so concurrent writers for the same task_id serialize and
//! the monotonic rule in [`decide`] holds across them.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use virtflow_core::TaskStatus;

use crate::error::{StateError, StateResult};
use crate::tables::TASK_STATUS;
use crate::types::{StatusRecord, StatusUpdate, UpsertOutcome, decide};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The status-store collaborator seen by workers and the submission path.
pub trait StatusStore: Send + Sync {
    /// Create the schema if it does not exist. Safe to call repeatedly.
    fn init_schema(&self) -> StateResult<()>;

    /// Write a status if the monotonic rule allows it.
    fn upsert_status(&self, update: &StatusUpdate) -> StateResult<UpsertOutcome>;

    /// Current status of a task, `None` if unknown.
    fn get_status(&self, task_id: &str) -> StateResult<Option<StatusRecord>>;
}

/// Thread-safe status store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.init_schema()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.init_schema()?;
        debug!("in-memory state store opened");
        Ok(store)
    }
}

impl StatusStore for StateStore {
    fn init_schema(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASK_STATUS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn upsert_status(&self, update: &StatusUpdate) -> StateResult<UpsertOutcome> {
        if update.status == TaskStatus::Completed && update.node.is_none() {
            return Err(StateError::InvalidUpdate(format!(
                "task {} completed without a node",
                update.task_id
            )));
        }

        let key = update.task_id.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(TASK_STATUS).map_err(map_err!(Table))?;
            let existing: Option<StatusRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            outcome = decide(existing.as_ref(), update);
            if outcome == UpsertOutcome::Applied {
                let record = StatusRecord {
                    task_id: update.task_id.clone(),
                    status: update.status,
                    node: update.stored_node(),
                    retry_count: update.retry_count,
                    updated_at: epoch_secs(),
                };
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            task_id = %key,
            status = %update.status,
            retry_count = update.retry_count,
            ?outcome,
            "status upsert"
        );
        Ok(outcome)
    }

    fn get_status(&self, task_id: &str) -> StateResult<Option<StatusRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASK_STATUS).map_err(map_err!(Table))?;
        match table.get(task_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: StatusRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn get_unknown_task_returns_none() {
        let store = test_store();
        assert!(store.get_status("nope").unwrap().is_none());
    }

    #[test]
    fn upsert_and_get() {
        let store = test_store();
        let outcome = store.upsert_status(&StatusUpdate::pending("t-1", 0)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Applied);

        let record = store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.node.is_none());
    }

    #[test]
    fn init_schema_is_idempotent() {
        let store = test_store();
        store.upsert_status(&StatusUpdate::pending("t-1", 0)).unwrap();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
        assert!(store.get_status("t-1").unwrap().is_some());
    }

    #[test]
    fn completed_upsert_twice_leaves_identical_state() {
        let store = test_store();
        let update = StatusUpdate::completed("t-1", "bm02", 0);

        assert_eq!(store.upsert_status(&update).unwrap(), UpsertOutcome::Applied);
        let once = store.get_status("t-1").unwrap().unwrap();

        assert_eq!(store.upsert_status(&update).unwrap(), UpsertOutcome::Unchanged);
        let twice = store.get_status("t-1").unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.node.as_deref(), Some("bm02"));
    }

    #[test]
    fn stale_running_never_downgrades_completed() {
        let store = test_store();
        store.upsert_status(&StatusUpdate::running("t-1", 0)).unwrap();
        store
            .upsert_status(&StatusUpdate::completed("t-1", "bm01", 0))
            .unwrap();

        let outcome = store.upsert_status(&StatusUpdate::running("t-1", 0)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Ignored);

        let record = store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.node.as_deref(), Some("bm01"));
    }

    #[test]
    fn failed_record_has_no_node() {
        let store = test_store();
        store.upsert_status(&StatusUpdate::failed("t-9", 3)).unwrap();
        let record = store.get_status("t-9").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.node.is_none());
        assert_eq!(record.retry_count, 3);
    }

    #[test]
    fn completed_without_node_is_rejected() {
        let store = test_store();
        let mut update = StatusUpdate::completed("t-1", "bm01", 0);
        update.node = None;
        assert!(matches!(
            store.upsert_status(&update),
            Err(StateError::InvalidUpdate(_))
        ));
        assert!(store.get_status("t-1").unwrap().is_none());
    }

    #[test]
    fn tasks_are_independent() {
        let store = test_store();
        store.upsert_status(&StatusUpdate::failed("a", 3)).unwrap();
        store.upsert_status(&StatusUpdate::pending("b", 0)).unwrap();

        assert_eq!(
            store.get_status("a").unwrap().unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(
            store.get_status("b").unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("status.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .upsert_status(&StatusUpdate::completed("t-1", "bm02", 1))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn concurrent_writers_resolve_toward_terminal() {
        let store = test_store();
        store.upsert_status(&StatusUpdate::running("t-1", 0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        store.upsert_status(&StatusUpdate::running("t-1", 0)).unwrap();
                    } else {
                        store
                            .upsert_status(&StatusUpdate::completed("t-1", "bm02", 0))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let record = store.get_status("t-1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }
}
