mod bridge;
mod config;
mod controller;
mod transport;
mod virtual_controller;

use anyhow::Context;
use bridge::Bridge;
use config::BridgeConfig;
use crossbeam_channel::RecvTimeoutError;
use hidapi::HidApi;
use std::time::Duration;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BridgeConfig::load();
    if !BridgeConfig::config_path().exists() {
        if let Err(e) = config.save() {
            log::warn!("Could not write default config: {}", e);
        }
    }

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut api =
        HidApi::new().map_err(|e| anyhow::anyhow!("Failed to initialize hidapi: {}", e))?;
    let mut bridge = Bridge::new(config.clone());

    log::info!(
        "Waiting for Stadia controllers (up to {}), press Ctrl-C to exit",
        config.max_devices
    );

    loop {
        if let Err(e) = bridge.refresh(&mut api) {
            log::error!("Controller scan failed: {:#}", e);
        }

        match stop_rx.recv_timeout(config.refresh_interval()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!("Shutting down");
    bridge.shutdown(SHUTDOWN_TIMEOUT);
    Ok(())
}
