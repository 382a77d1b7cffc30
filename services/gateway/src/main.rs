// fabgate gateway
// ---------------
// Exposes a permissioned ledger as a conventional HTTP+WebSocket service:
// submit transactions, fetch receipts, and stream filtered chaincode
// events to webhook or websocket sinks with durable, checkpointed
// at-least-once delivery.
//
// Storage model:
// - Streams, subscriptions and per-subscription block checkpoints live in
//   an embedded key-value store (RocksDB by default, in-memory for dev).
// - Checkpoints advance only after a sink acks a batch, so a restart
//   redelivers anything that was in flight.
use anyhow::{Context, Result};
use fabgate_events::kvstore::{KvStore, MemoryKv, RocksKv};
use fabgate_events::ledger::LedgerClient;
use fabgate_events::ledger::mock::MockLedger;
use fabgate_events::SubscriptionManager;
use fabgate_ws::WsChannels;
use gateway::app::{AppState, build_router};
use gateway::config::{GatewayConfig, StorageBackend};
use gateway::observability;
use gateway::receipts::ReceiptStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();

    let config = GatewayConfig::from_env_or_yaml().context("gateway config")?;
    let db: Arc<dyn KvStore> = match config.events.storage {
        StorageBackend::Memory => Arc::new(MemoryKv::new()),
        StorageBackend::Rocksdb => Arc::new(
            RocksKv::open(&config.events.db_path)
                .with_context(|| format!("open event store at {:?}", config.events.db_path))?,
        ),
    };

    let channels = Arc::new(WsChannels::new());
    // In-process ledger simulator; a production deployment wires a real
    // ledger connector behind the same trait.
    let ledger: Arc<dyn LedgerClient> = Arc::new(MockLedger::new());
    let manager = Arc::new(SubscriptionManager::new(
        config.event_stream_conf(),
        ledger.clone(),
        channels.clone(),
        db,
    ));
    manager
        .init()
        .await
        .context("failed to initialize event streams")?;

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = AppState {
        manager: manager.clone(),
        channels,
        ledger,
        receipts: Arc::new(ReceiptStore::new()),
    };
    let app = build_router(state);

    let addr = config.bind_addr;
    tracing::info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.close().await;
    Ok(())
}
