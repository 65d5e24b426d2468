use anyhow::{Context, Result};
use buffered_spi::config::Config;
use buffered_spi::daemon::Daemon;
use log::{error, info};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command line arguments
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "/etc/buffered-spi/config.yaml".to_string()),
    );

    info!("Buffered SPI loopback daemon starting...");
    info!("Loading configuration from: {}", config_path.display());

    // Load configuration
    let config = Config::load(&config_path)?;
    info!("Configuration loaded successfully");

    let mut daemon = Daemon::new(config)?;

    // Setup signal handling via tokio
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Daemon started successfully");

    loop {
        tokio::select! {
            result = daemon.poll() => {
                if let Err(e) = result {
                    error!("Daemon poll error: {}", e);
                    return Err(e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match Config::load(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = daemon.reload_config(new_config).await {
                            error!("Reload failed, keeping current configuration: {:#}", e);
                        }
                    }
                    Err(e) => error!("Keeping current configuration: {:#}", e),
                }
            }
        }
    }

    daemon.shutdown()?;
    info!("Buffered SPI daemon shutdown complete");
    Ok(())
}

fn init_logger() {
    // Use `env_logger` for logging. Systemd/journald will capture stdout/stderr.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}
