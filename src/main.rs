use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;

use adkiosk_lib::state::{load_config, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            return ExitCode::from(2);
        }
    };

    let state = match AppState::open(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            log::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Kiosk {} starting", state.config.device_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Shutdown requested"),
            Err(e) => {
                // Keep the sender alive; dropping it reads as shutdown.
                log::warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    match adkiosk_lib::run(state, shutdown_rx).await {
        Ok(()) => {
            log::info!("Kiosk stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Stopping on fatal error: {} ({})", e, e.recovery_suggestion());
            ExitCode::FAILURE
        }
    }
}
