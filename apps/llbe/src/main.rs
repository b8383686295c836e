use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use llbe::{
    cli::{self, Cli, Commands},
    telemetry::Telemetry,
    Relay,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::InitConfig { path, force }) => return cli::init_config(&path, force),
        Some(Commands::CheckConfig) => return cli::check_config(&cli.config),
        None => {}
    }

    let config = cli::load_config(&cli.config)?;
    let telemetry = Telemetry::init(&config.logging)?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found; using defaults");
    }
    info!(config = %cli.config.display(), version = env!("CARGO_PKG_VERSION"), "starting llbe");

    let relay = match Relay::start(&config).await {
        Ok(relay) => relay,
        Err(err) => {
            error!(error = %format!("{err:#}"), "relay failed to start");
            telemetry.shutdown();
            return Err(err);
        }
    };

    shutdown_signal().await?;
    info!("shutdown requested");
    relay.shutdown().await;
    telemetry.shutdown();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
