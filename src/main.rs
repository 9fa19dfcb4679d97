use std::time::Duration;
use tokio::sync::broadcast;

use signal_pipeline::chat_source::TelegramChatSource;
use signal_pipeline::config::Config;
use signal_pipeline::entry_engine::EntryEngine;
use signal_pipeline::exchange_gateway::BybitGateway;
use signal_pipeline::hedge_manager::HedgeManager;
use signal_pipeline::ingestion::Ingestion;
use signal_pipeline::lifecycle_manager::LifecycleManager;
use signal_pipeline::lifecycle_store::LifecycleStore;
use signal_pipeline::position_lock::PositionLocks;
use signal_pipeline::publisher::Publisher;
use signal_pipeline::pyramid_manager::PyramidManager;
use signal_pipeline::signal_store::SignalStore;
use signal_pipeline::telemetry;
use signal_pipeline::watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cfg = Config::from_env();
    log::info!(
        "starting signal pipeline: max_concurrent_positions={} extract_only={}",
        cfg.max_concurrent_positions, cfg.extract_only
    );

    let signals = SignalStore::new(&cfg.sqlite_path)?;
    let positions = LifecycleStore::new(&cfg.sqlite_path)?;
    let (telemetry_sink, telemetry_handle) = telemetry::spawn(cfg.telemetry_path.clone(), 1024);

    let gateway = BybitGateway::new(&cfg);
    let chat = TelegramChatSource::new(&cfg);
    let publisher = Publisher::new(chat.clone());
    let watchdog = Watchdog::new(cfg.clone(), gateway.clone(), signals.clone(), positions.clone(), telemetry_sink.clone());
    let position_locks = PositionLocks::new();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // ── Ingestion: chat long-poll → dedup/detect/persist ─────────────────────
    let ingestion = Ingestion::new(cfg.clone(), chat.clone(), signals.clone(), telemetry_sink.clone());
    let ingestion_handle = tokio::spawn(async move {
        if let Err(e) = ingestion.run().await {
            log::error!("ingestion task terminated: {}", e);
        }
    });

    // ── Entry engine: claim NEW signals, place dual-limit entries ────────────
    let entry_engine = EntryEngine::new(cfg.clone(), gateway.clone(), signals.clone(), positions.clone(), telemetry_sink.clone(), watchdog, Publisher::new(chat.clone()));
    let entry_poll = cfg.entry_poll_interval_secs;
    let mut entry_shutdown = shutdown_tx.subscribe();
    let entry_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = entry_shutdown.recv() => { log::info!("entry engine shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(entry_poll)) => {}
            }
            if let Err(e) = entry_engine.tick().await {
                log::warn!("entry engine tick failed: {}", e);
            }
        }
    });

    // ── Lifecycle manager: fill polling, TP/SL attach, trailing stop ─────────
    let lifecycle = LifecycleManager::new(cfg.clone(), gateway.clone(), positions.clone(), telemetry_sink.clone(), Publisher::new(chat.clone()), position_locks.clone());
    let lifecycle_poll = cfg.lifecycle_poll_interval_secs;
    let mut lifecycle_shutdown = shutdown_tx.subscribe();
    let lifecycle_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = lifecycle_shutdown.recv() => { log::info!("lifecycle manager shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(lifecycle_poll)) => {}
            }
            if let Err(e) = lifecycle.tick().await {
                log::warn!("lifecycle tick failed: {}", e);
            }
        }
    });

    // ── Pyramid manager: scale winners up the ladder ─────────────────────────
    let pyramid = PyramidManager::new(cfg.clone(), gateway.clone(), positions.clone(), telemetry_sink.clone(), position_locks.clone());
    let pyramid_poll = cfg.pyramid_poll_interval_secs;
    let mut pyramid_shutdown = shutdown_tx.subscribe();
    let pyramid_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pyramid_shutdown.recv() => { log::info!("pyramid manager shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(pyramid_poll)) => {}
            }
            if let Err(e) = pyramid.tick().await {
                log::warn!("pyramid tick failed: {}", e);
            }
        }
    });

    // ── Hedge manager: adverse-move hedge + bounded re-entry ─────────────────
    let hedge = HedgeManager::new(cfg.clone(), gateway.clone(), signals.clone(), positions.clone(), telemetry_sink.clone(), position_locks.clone());
    let hedge_poll = cfg.hedge_poll_interval_secs;
    let mut hedge_shutdown = shutdown_tx.subscribe();
    let hedge_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hedge_shutdown.recv() => { log::info!("hedge manager shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(hedge_poll)) => {}
            }
            if let Err(e) = hedge.tick().await {
                log::warn!("hedge tick failed: {}", e);
            }
        }
    });

    // ── Watchdog: maintenance sweep + exchange reconciliation ────────────────
    let watchdog_maintenance = Watchdog::new(cfg.clone(), gateway.clone(), signals.clone(), positions.clone(), telemetry_sink.clone());
    let maintenance_interval = cfg.maintenance_interval_secs;
    let mut maintenance_shutdown = shutdown_tx.subscribe();
    let maintenance_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = maintenance_shutdown.recv() => { log::info!("maintenance sweep shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(maintenance_interval)) => {}
            }
            if let Err(e) = watchdog_maintenance.maintenance_tick().await {
                log::warn!("maintenance tick failed: {}", e);
            }
        }
    });

    let watchdog_reconcile = Watchdog::new(cfg.clone(), gateway.clone(), signals.clone(), positions.clone(), telemetry_sink.clone());
    let reconcile_interval = cfg.reconcile_interval_secs;
    let mut reconcile_shutdown = shutdown_tx.subscribe();
    let reconcile_handle = tokio::spawn(async move {
        watchdog_reconcile.reconcile().await.unwrap_or_else(|e| log::warn!("startup reconcile failed: {}", e));
        loop {
            tokio::select! {
                _ = reconcile_shutdown.recv() => { log::info!("reconcile loop shutting down"); return; }
                _ = tokio::time::sleep(Duration::from_secs(reconcile_interval)) => {}
            }
            if let Err(e) = watchdog_reconcile.reconcile().await {
                log::warn!("reconcile tick failed: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, stopping task loops");
    let _ = shutdown_tx.send(());

    for handle in [entry_handle, lifecycle_handle, pyramid_handle, hedge_handle, maintenance_handle, reconcile_handle] {
        let _ = handle.await;
    }
    ingestion_handle.abort();
    drop(telemetry_sink);
    let _ = telemetry_handle.await;

    Ok(())
}
