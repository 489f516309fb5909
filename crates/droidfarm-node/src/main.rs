use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use droidfarm_node::internal_queue::{
    FileQueuePersistence, InternalQueue, QueuePersistence, DEFAULT_DEBOUNCE,
};
use droidfarm_node::{JobExecutor, NodeConfig, NodeSession, SimulatedDriver};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("droidfarm_node=debug,info")),
        )
        .init();

    let config = NodeConfig::from_env();
    tracing::info!(
        node_id = %config.node_id,
        devices = config.device_ids.len(),
        server = %config.server_url,
        "droidfarm-node starting"
    );

    // Internal queue, optionally persisted across restarts
    let queue = match &config.queue_state_path {
        Some(path) => {
            let adapter = Arc::new(FileQueuePersistence::new(path));
            let queue = InternalQueue::new().with_persistence(adapter.clone(), DEFAULT_DEBOUNCE);
            if let Ok(Some(snapshot)) = adapter.load().await {
                queue.restore(snapshot);
            }
            queue
        }
        None => Arc::new(InternalQueue::new()),
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let executor = JobExecutor::new(Arc::new(SimulatedDriver), queue.clone(), outbound_tx);
    let session = NodeSession::new(config, executor, outbound_rx);

    tokio::select! {
        result = session.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "session terminated");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Flush the buffer before exit; a crash loses at most the debounce window
    match tokio::time::timeout(Duration::from_secs(5), queue.persist_now()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "queue flush failed"),
        Err(_) => tracing::warn!("queue flush timed out"),
    }
    tracing::info!("droidfarm-node stopped");
    Ok(())
}
