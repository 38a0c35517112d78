//! Ralpher - Ralph loop orchestrator daemon
//!
//! Server entry point: open the store, wire the manager, run until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use tracing::info;

use ralpher::backend::BackendManager;
use ralpher::cli::Cli;
use ralpher::config::{Config, PREF_LOG_LEVEL, tracing_level};
use ralpher::events::create_event_bus;
use ralpher::git::GitService;
use ralpher::r#loop::{LoopManager, LoopManagerConfig};
use ralpher::state::StateManager;
use ralpher::store::Store;

fn setup_logging(level_name: &str) -> Result<()> {
    let level = tracing_level(level_name);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .or_else(|| ralpher::config::default_config_path().filter(|p| p.exists()));
    let config = Config::load(config_path.as_deref())?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data_dir.clone());

    // The persisted log-level preference lives in the store, so open it
    // before logging is configured. Priority: CLI > environment/file >
    // persisted preference > info.
    let store = Store::open(&data_dir)?;
    let persisted_level = store.get_preference(PREF_LOG_LEVEL).ok().flatten();
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .or(persisted_level)
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level)?;

    info!(data_dir = %data_dir.display(), %level, remote_only = config.remote_only, "rd starting");

    let state = StateManager::spawn_with_store(store);
    let events = create_event_bus();
    let backends = Arc::new(BackendManager::new(config.remote_only));
    let git = GitService::local();

    let manager_config = LoopManagerConfig {
        persist_interval: std::time::Duration::from_millis(config.persist_interval_ms),
        ..Default::default()
    };
    let manager = LoopManager::new(manager_config, state.clone(), git, events, backends.clone());

    let interrupted = manager.recover().await?;
    if !interrupted.is_empty() {
        info!(count = interrupted.len(), "Interrupted loops will recover lazily");
    }

    info!("rd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    manager.shutdown().await;
    backends.shutdown().await;
    state.shutdown().await.ok();
    Ok(())
}
