//! Standalone mode: every subsystem in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use virtflow_core::VirtflowConfig;
use virtflow_core::config::InventoryConfig;
use virtflow_placement::{ScoringStrategy, Selector};
use virtflow_scheduler::{
    MemoryQueue, NodeInventory, NodeSource, RetryPolicy, RetryScheduler, Submitter, Worker,
    WorkerPool, source_from_config,
};
use virtflow_state::{StateStore, StatusStore};

pub fn describe_source(config: &InventoryConfig) -> String {
    match source_from_config(config) {
        Ok(source) => source.describe(),
        Err(e) => format!("<{e}>"),
    }
}

pub async fn run(config: VirtflowConfig, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("virtflow daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("virtflow.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // Status store.
    let state = StateStore::open(&db_path)?;
    let store: Arc<dyn StatusStore> = Arc::new(state);
    info!(path = ?db_path, "status store opened");

    // Node inventory.
    let source = source_from_config(&config.inventory)?;
    let inventory = Arc::new(NodeInventory::new(
        source,
        config.inventory.refresh_interval(),
    ));
    match inventory.refresh().await {
        Ok(nodes) => info!(nodes, source = %inventory.source_description(), "initial inventory loaded"),
        Err(e) => warn!(error = %e, "initial inventory refresh failed, starting with no nodes"),
    }

    // Queue and retry scheduler.
    let queue = MemoryQueue::with_capacity(config.worker.queue_capacity);
    let (retry_scheduler, retries) = RetryScheduler::new(Arc::new(queue.clone()), store.clone());
    let policy = RetryPolicy::from_config(&config.retry);
    info!(
        max_retries = policy.max_retries,
        base_delay_ms = config.retry.base_delay_ms,
        jitter_ceiling_ms = config.retry.jitter_ceiling_ms,
        "retry policy configured"
    );

    // Workers.
    let selector = Selector::new(ScoringStrategy::from_config(&config.placement));
    info!(strategy = selector.strategy().name(), "selector initialized");
    let worker = Worker::new(
        Arc::new(queue.clone()),
        inventory.clone(),
        store.clone(),
        retries,
        selector,
        policy,
    );

    let submitter = Submitter::new(
        Arc::new(queue.clone()),
        store.clone(),
        config.worker.publish_timeout(),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let inventory_handle = tokio::spawn({
        let inventory = inventory.clone();
        let shutdown = shutdown_rx.clone();
        async move { inventory.run(shutdown).await }
    });
    let retry_handle = tokio::spawn(retry_scheduler.run(shutdown_rx.clone()));
    let pool = WorkerPool::spawn(worker, config.worker.count, shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = virtflow_api::build_router(virtflow_api::ApiState {
        submitter,
        inventory,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Workers stop taking new deliveries first, then waiting retries are
    // flushed back onto the queue.
    pool.join().await;
    let _ = retry_handle.await;
    let _ = inventory_handle.await;
    queue.close();

    if !queue.is_empty() {
        warn!(
            undelivered = queue.len(),
            "in-process queue holds undelivered tasks at exit"
        );
    }

    info!("virtflow daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_source_is_described_as_error() {
        let described = describe_source(&InventoryConfig::default());
        assert!(described.starts_with("<configuration error"));
    }

    #[tokio::test]
    async fn file_source_feeds_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(
            &path,
            r#"[{"name":"bm01","cpu":16,"memory":32768,"usage_cpu":0.3,"usage_mem":0.4,
                "pool":"default","max_vms":4,"current_vms":1}]"#,
        )
        .unwrap();

        let config = InventoryConfig {
            source_file: Some(path),
            ..InventoryConfig::default()
        };
        let inventory = NodeInventory::new(
            source_from_config(&config).unwrap(),
            config.refresh_interval(),
        );
        assert_eq!(inventory.refresh().await.unwrap(), 1);
    }
}
