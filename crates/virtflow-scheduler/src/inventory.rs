//! NodeInventory — the latest known list of physical nodes.
//!
//! A background loop refreshes the list from a [`NodeSource`] on a fixed
//! interval. Readers take an `Arc` to the current snapshot and are never
//! blocked by a refresh: the new list is built off to the side and swapped
//! in whole, so a reader sees either the old list or the new one.
//!
//! A failed refresh keeps the previous snapshot. Before the first success
//! the snapshot is empty, and every selection finds no node.
//!
//! The inventory does not track assignments. A node's `current_vm_count`
//! only moves when the source reports it, so between refreshes several
//! tasks may be placed on the same last free slot.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use virtflow_core::Node;

use crate::error::SchedulerResult;
use crate::source::NodeSource;

/// One immutable copy of the node list.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    nodes: Vec<Node>,
    /// Unix timestamp (seconds) of the refresh that produced this snapshot.
    pub captured_at: u64,
    /// Number of successful refreshes so far; 0 for the initial empty list.
    pub generation: u64,
}

impl InventorySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct NodeInventory {
    source: Arc<dyn NodeSource>,
    current: RwLock<Arc<InventorySnapshot>>,
    refresh_interval: Duration,
}

impl NodeInventory {
    pub fn new(source: Arc<dyn NodeSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(InventorySnapshot::empty())),
            refresh_interval,
        }
    }

    /// The most recent successfully fetched node list.
    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    /// Fetch the node list once and swap it in.
    ///
    /// Nodes that fail validation are dropped from the new snapshot. On a
    /// source error the previous snapshot stays in place and the error is
    /// returned.
    pub async fn refresh(&self) -> SchedulerResult<usize> {
        let fetched = self.source.list_nodes().await?;
        let total = fetched.len();

        let nodes: Vec<Node> = fetched
            .into_iter()
            .filter(|node| match node.validate() {
                Ok(()) => true,
                Err(reason) => {
                    warn!(node = %node.name, reason, "dropping invalid node from inventory");
                    false
                }
            })
            .collect();
        let kept = nodes.len();

        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let generation = current.generation + 1;
            *current = Arc::new(InventorySnapshot {
                nodes,
                captured_at: epoch_secs(),
                generation,
            });
        }

        debug!(nodes = kept, dropped = total - kept, "inventory refreshed");
        Ok(kept)
    }

    /// Refresh on every interval until shutdown. Errors are logged and the
    /// loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            source = %self.source.describe(),
            interval_secs = self.refresh_interval.as_secs(),
            "inventory refresher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "inventory refresh failed, keeping previous snapshot");
                    }
                }
                _ = shutdown.changed() => {
                    info!("inventory refresher shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
