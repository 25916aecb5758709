//! roastwatchd - coffee roast detection service
//!
//! This daemon:
//! 1. Loads configuration (ROASTWATCH_CONFIG file plus env overrides)
//! 2. Opens the job store and fails jobs interrupted by a previous shutdown
//! 3. Serves the detection API under /api until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use roastwatch::api::{ApiServer, ApiState};
use roastwatch::config::RoastwatchConfig;
use roastwatch::LiveStage;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RoastwatchConfig::load()?;
    let service = config.open_service()?;

    let recovered = service
        .store()
        .recover_interrupted()
        .map_err(|e| anyhow!("failed to recover interrupted jobs: {}", e))?;
    if recovered > 0 {
        log::warn!(
            "marked {} job(s) left in processing as failed",
            recovered
        );
    }

    log::info!("detector backend: {}", service.detector().backend_name());

    let state = Arc::new(ApiState {
        service,
        live: LiveStage::new(),
    });
    let api_handle = ApiServer::new(config.api_config(), state).spawn()?;
    log::info!(
        "roastwatchd running. db {} data {}",
        config.db_path,
        config.data_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("roastwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
