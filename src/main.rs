// DuckCoding transparent proxy core
//
// A headless supervisor that fronts each supported AI CLI with a local
// authenticating reverse proxy, extracts token usage from the response
// streams, prices it, and keeps per-session aggregates in SQLite. The
// desktop shell talks to the command surface; this binary wires the
// components together and runs until SIGINT/SIGTERM.
//
// Architecture:
// - store: typed file manager for everything under ~/.duckcoding
// - profiles: credential profiles + tool-native config sync
// - watcher: scan/diff guard over the native files
// - pricing/usage: per-tool token extraction and costing
// - sessions/stats: aggregates and the SQLite log store
// - proxy: one axum instance per tool, managed lifecycle
// - commands: the RPC surface the shell calls

mod cli;
mod commands;
mod error;
mod events;
mod logging;
mod models;
mod paths;
mod pricing;
mod profiles;
mod proxy;
mod sessions;
mod stats;
mod store;
mod tools;
mod usage;
mod watcher;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use commands::CommandHub;
use events::EventBus;
use models::GlobalConfig;
use profiles::ProfileManager;
use proxy::ProxyManager;
use sessions::SessionManager;
use stats::StatsStore;
use store::DataStore;
use watcher::ConfigWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let data_store = Arc::new(DataStore::new());
    let global: GlobalConfig = data_store
        .read_json(&paths::global_file())
        .context("load global.json")?;

    // Keep the appender guard alive until exit so buffered logs flush
    let _log_guard = logging::init(&global);

    if cli::handle(&args).await? {
        return Ok(());
    }

    tracing::info!(
        "duckcoding core {} starting (data root {})",
        env!("CARGO_PKG_VERSION"),
        paths::data_root().display()
    );

    // Process singletons, torn down in reverse order on shutdown
    let stats = StatsStore::open(&paths::stats_db_file()).context("open stats store")?;
    let sessions = SessionManager::new(stats.clone());
    let events = EventBus::new();
    let profiles = Arc::new(ProfileManager::new(data_store.clone()));
    let proxies = Arc::new(ProxyManager::new(
        data_store.clone(),
        profiles.clone(),
        sessions.clone(),
        stats.clone(),
        events.clone(),
    ));
    let config_watcher = Arc::new(ConfigWatcher::new(
        data_store.clone(),
        profiles.clone(),
        events.clone(),
    ));

    let hub = Arc::new(CommandHub {
        store: data_store,
        profiles,
        proxies: proxies.clone(),
        watcher: config_watcher.clone(),
        sessions: sessions.clone(),
        stats: stats.clone(),
        events: events.clone(),
    });

    // Seed pricing presets so first-run resolution works
    if let Err(e) = hub.list_pricing_templates() {
        tracing::warn!("pricing preset install failed: {e}");
    }

    config_watcher.start().await;
    proxies.auto_start_on_launch().await;

    // Surface events for headless runs; the desktop shell subscribes the
    // same way
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!("event: {line}");
            }
        }
    });

    wait_for_shutdown().await;
    tracing::info!("shutting down");

    // Stop accepting traffic, then flush aggregates, then close the store
    proxies.stop_all().await;
    config_watcher.stop().await;
    sessions.flush().await;
    stats.shutdown();

    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("SIGTERM handler failed: {e}; falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
