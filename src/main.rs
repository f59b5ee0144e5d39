//! Tycoon Game Server
//!
//! Wires the store, game manager, action worker, connection hub and
//! WebSocket server together and runs them until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tycoon::{
    config::AppConfig,
    network::{ConnectionHub, GameServer, Relays},
    store::MemoryBackend,
    ActionQueue, GameManager, ResilientStore, Worker, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "tycoon=debug,info";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .init();

    let config = AppConfig::from_env();
    info!("Tycoon Server v{}", VERSION);
    if !config.auth.is_configured() {
        warn!(anonymous = config.auth.allow_anonymous, "No token key configured");
    }

    let store = match &config.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using file backends");
            ResilientStore::open_dir(dir, &config.store)
                .await
                .with_context(|| format!("opening store in {}", dir.display()))?
        }
        None => {
            warn!("TYCOON_DATA_DIR not set; games will not survive a restart");
            ResilientStore::connect(
                Arc::new(MemoryBackend::new("documents")),
                Arc::new(MemoryBackend::new("cache")),
                &config.store,
            )
            .await
            .context("connecting in-memory store")?
        }
    };
    let store = Arc::new(store);

    let manager = Arc::new(GameManager::new(Arc::clone(&store), config.game.clone()));
    let queue = ActionQueue::new(Arc::clone(&store));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (hub, hub_events, hub_task) = ConnectionHub::spawn(config.hub.clone(), shutdown_rx.clone());

    let worker = Worker::new(Arc::clone(&manager), queue.clone(), config.worker.clone());
    let rejections = worker.subscribe_rejections();
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));

    let relays = Relays::spawn(
        Arc::clone(&manager),
        queue.clone(),
        hub.clone(),
        hub_events,
        rejections,
        shutdown_rx.clone(),
    );

    let server = GameServer::new(config.server.clone(), config.auth.clone(), manager, queue, hub);
    let server_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => warn!(error = %e, "Server failed"),
                Err(e) => warn!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = worker_task.await;
    relays.join().await;
    let _ = hub_task.await;
    info!("Shutdown complete");

    Ok(())
}
